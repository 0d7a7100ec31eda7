//! Agent side of the tunnel.
//!
//! # Data Flow
//! ```text
//! connect relay connector (WebSocket)
//!     → authorize, wait for ping acknowledgement
//!     → rpc-request → handler.rs (local HTTP) → rpc-response, one task each
//!     → raw → handler registered for its kind
//!     → periodic ping; missing answers end the connection
//! on disconnect: backoff (resilience::backoff), reconnect
//! ```

pub mod client;
pub mod handler;

pub use client::{Agent, AgentError, RawHandler};
pub use handler::{handler_fn, FnHandler, HandlerError, LocalHttpHandler, ReqwestHandler};
