//! Transport layer.
//!
//! # Data Flow
//! ```text
//! Agent connection
//!     → websocket.rs (axum socket on the relay, tungstenite on the agent)
//!     → transport.rs (split into FrameSink + FrameSource)
//!     → session layer (one writer lock, one dispatcher)
//!
//! Tests and embedders:
//!     memory.rs (in-process pair implementing the same traits)
//! ```
//!
//! # Design Decisions
//! - Sessions only see the `FrameSink`/`FrameSource` traits, never a socket
//! - One binary WebSocket message carries exactly one encoded envelope
//! - TLS is optional and terminated at the public listener

pub mod memory;
pub mod tls;
pub mod transport;
pub mod websocket;

pub use transport::{CloseReason, FrameSink, FrameSource, TransportError};
