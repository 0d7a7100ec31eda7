//! Session registry: one live agent connection per (identity, channel).
//!
//! # Data Flow
//! ```text
//! connector handshake
//!     → registry.rs authorize() (directory checks, atomic supersede)
//!     → connection.rs Session (write lock, pending map, statistics)
//!     → dispatch.rs (single inbound reader per session)
//!
//! Termination (superseded | disconnected | liveness | protocol | shutdown)
//!     → Session::close (fail pending calls, close transport)
//!     → registry.remove (only if the map still holds this session)
//! ```
//!
//! # Design Decisions
//! - Supersession is a single map insert; the displaced session is closed after
//! - Removal compares session ids, so a stale remove never evicts a newer session
//! - Every terminal state converges on `Session::close`, which is idempotent

pub mod connection;
pub mod dispatch;
pub mod registry;
pub mod stats;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::net::CloseReason;

pub use connection::{SendError, Session};
pub use dispatch::run_dispatcher;
pub use registry::{AuthorizationError, RawSendError, RegistryOptions, SessionNotFound, SessionRegistry, SessionSummary};
pub use stats::{ChannelStatistics, StatisticsSnapshot};

static SESSION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique session identifier, for logs and stale-removal checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new() -> Self {
        Self(SESSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Registry key. Both parts are normalized directory keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub identity: String,
    pub channel: String,
}

impl SessionKey {
    pub fn new(identity: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            channel: channel.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.identity, self.channel)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// A newer session authorized for the same key.
    Superseded,
    /// The transport closed or failed.
    Disconnected,
    /// No liveness signal within the configured timeout.
    LivenessExpired,
    /// Too many consecutive malformed envelopes.
    ProtocolViolation,
    /// The relay is shutting down.
    Shutdown,
}

impl SessionEnd {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEnd::Superseded => "superseded",
            SessionEnd::Disconnected => "disconnected",
            SessionEnd::LivenessExpired => "liveness_expired",
            SessionEnd::ProtocolViolation => "protocol_violation",
            SessionEnd::Shutdown => "shutdown",
        }
    }

    pub fn close_reason(&self) -> CloseReason {
        match self {
            SessionEnd::Superseded => CloseReason::SUPERSEDED,
            SessionEnd::Disconnected => CloseReason::NORMAL,
            SessionEnd::LivenessExpired => CloseReason::LIVENESS,
            SessionEnd::ProtocolViolation => CloseReason::PROTOCOL,
            SessionEnd::Shutdown => CloseReason::GOING_AWAY,
        }
    }
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn key_displays_as_path() {
        assert_eq!(SessionKey::new("alice", "home").to_string(), "alice/home");
    }
}
