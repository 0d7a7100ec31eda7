//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured tracing events)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout (pretty for development, JSON for aggregation)
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Identity, channel, session and correlation ids are structured fields
//! - `RUST_LOG` overrides the configured level
//! - Metric helpers are no-ops until a recorder is installed

pub mod logging;
pub mod metrics;
