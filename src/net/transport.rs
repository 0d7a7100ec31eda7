//! Transport abstraction used by sessions.
//!
//! A duplex connection is split into a [`FrameSink`] (shared by every task
//! that writes to the session) and a [`FrameSource`] (owned by the session's
//! single inbound dispatcher).

use async_trait::async_trait;
use bytes::Bytes;

/// WebSocket close code sent when an agent fails to authorize.
pub const CLOSE_UNAUTHORIZED: u16 = 4001;
/// Close code sent when a newer session replaced this one.
pub const CLOSE_SUPERSEDED: u16 = 4002;
/// Close code sent when the agent stopped proving liveness.
pub const CLOSE_LIVENESS: u16 = 4003;
/// Close code sent after repeated protocol violations.
pub const CLOSE_PROTOCOL: u16 = 4004;
/// Server cannot take the session right now; the agent should retry later.
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;
/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Server is going away.
pub const CLOSE_GOING_AWAY: u16 = 1001;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error("frame exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("send queue full")]
    Full,
}

impl TransportError {
    pub fn is_closed(&self) -> bool {
        matches!(self, TransportError::Closed)
    }
}

/// Reason attached to a close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: &'static str,
}

impl CloseReason {
    pub const fn new(code: u16, reason: &'static str) -> Self {
        Self { code, reason }
    }

    pub const UNAUTHORIZED: CloseReason = CloseReason::new(CLOSE_UNAUTHORIZED, "unauthorized");
    pub const SUPERSEDED: CloseReason = CloseReason::new(CLOSE_SUPERSEDED, "superseded");
    pub const LIVENESS: CloseReason = CloseReason::new(CLOSE_LIVENESS, "liveness timeout");
    pub const PROTOCOL: CloseReason = CloseReason::new(CLOSE_PROTOCOL, "protocol violation");
    pub const TRY_AGAIN_LATER: CloseReason = CloseReason::new(CLOSE_TRY_AGAIN_LATER, "try again later");
    pub const NORMAL: CloseReason = CloseReason::new(CLOSE_NORMAL, "closed");
    pub const GOING_AWAY: CloseReason = CloseReason::new(CLOSE_GOING_AWAY, "shutting down");
}

/// Outbound half. Implementations serialize concurrent writers so frames are
/// never interleaved.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Queue `frame`, waiting while the outbound queue is full.
    async fn send(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Queue `frame` without waiting; [`TransportError::Full`] if there is no room.
    fn try_send(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Close the connection. Closing twice is a no-op. Must not wait for
    /// frames that are stuck on the wire.
    async fn close(&self, reason: CloseReason);
}

/// Inbound half. `None` means the peer closed the connection.
#[async_trait]
pub trait FrameSource: Send {
    async fn receive(&mut self) -> Option<Result<Bytes, TransportError>>;
}
