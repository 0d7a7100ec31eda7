//! Relay that tunnels public HTTP requests to agents connected over WebSocket.

pub mod agent;
pub mod config;
pub mod directory;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod protocol;
pub mod resilience;
pub mod rpc;
pub mod session;

pub use config::schema::RelayConfig;
pub use http::RelayServer;
pub use lifecycle::Shutdown;
