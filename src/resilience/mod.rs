//! Resilience helpers.
//!
//! # Design Decisions
//! - Agents reconnect with capped exponential backoff plus jitter, so a relay
//!   restart is not met by every hub at the same instant

pub mod backoff;
