//! Public HTTP surface of the relay.
//!
//! # Data Flow
//! ```text
//! Agent:
//!     GET {connector_path} (WebSocket upgrade)
//!     → connector.rs (authorize handshake, ping ack, dispatcher)
//!
//! Public request:
//!     → server.rs middleware (request id, trace, body limit, timeout)
//!     → forward.rs
//!         → addressing.rs (basic credentials or access token → session)
//!         → rpc::call over the session
//!     → pass-through response, or 401 / 404 / 502 / 503 / 504
//! ```

pub mod addressing;
pub mod connector;
pub mod forward;
pub mod request;
pub mod server;

pub use forward::ForwardError;
pub use request::{request_id, X_REQUEST_ID};
pub use server::{AppState, RelayServer};
