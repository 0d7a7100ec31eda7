//! RPC correlation engine.
//!
//! # Data Flow
//! ```text
//! call(session, request, timeout)
//!     → pending.rs (register entry, unique correlation id, drop guard)
//!     → session.send(rpc-request)   (serialized write path)
//!     → await completion handle; one timeout bounds send and wait
//!
//! Inbound dispatcher (session::dispatch)
//!     → rpc-response → pending.complete(id, content)
//!
//! Session removal
//!     → pending.close_all() → every waiter gets ConnectionClosed
//! ```
//!
//! # Design Decisions
//! - Responses may complete in any order; nothing assumes FIFO
//! - Each entry resolves at most once; the map removal is the arbiter
//! - Timeout and client abort both drop the guard, which frees the slot

pub mod pending;

use std::time::Duration;

use crate::observability::metrics;
use crate::protocol::{Envelope, HttpRequestContent, HttpResponseContent};
use crate::session::{SendError, Session};

pub use pending::{CallResult, PendingCalls, PendingGuard};

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("too many pending requests (limit {limit})")]
    Exhausted { limit: usize },
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<SendError> for RpcError {
    fn from(err: SendError) -> Self {
        match err {
            SendError::Closed => RpcError::ConnectionClosed,
            SendError::Transport(e) if e.is_closed() => RpcError::ConnectionClosed,
            other => RpcError::Transport(other.to_string()),
        }
    }
}

/// Send `request` over `session` and wait for the matching response.
pub async fn call(
    session: &Session,
    request: HttpRequestContent,
    timeout: Duration,
) -> Result<HttpResponseContent, RpcError> {
    let (guard, rx) = session.pending().register()?;
    let correlation_id = guard.id();
    let _gauge = PendingGauge::track();

    tracing::debug!(
        session_id = %session.id(),
        correlation_id = %correlation_id,
        method = %request.method,
        uri = %request.uri,
        "Forwarding request over session"
    );
    // One deadline covers queueing the request and waiting for the answer.
    let exchange = async {
        let envelope = Envelope::rpc_request(correlation_id, request);
        tokio::select! {
            sent = session.send(&envelope) => sent?,
            _ = session.terminated() => return Err(RpcError::ConnectionClosed),
        }
        match rx.await {
            Ok(result) => result,
            // Sender dropped without a value: the entry was discarded by teardown.
            Err(_) => Err(RpcError::ConnectionClosed),
        }
    };
    let result = match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => {
            tracing::debug!(correlation_id = %correlation_id, ?timeout, "Correlation timed out");
            Err(RpcError::Timeout(timeout))
        }
    };
    drop(guard);
    result
}

/// Keeps the pending-correlations gauge in step with in-flight calls.
struct PendingGauge;

impl PendingGauge {
    fn track() -> Self {
        metrics::record_pending_delta(1.0);
        Self
    }
}

impl Drop for PendingGauge {
    fn drop(&mut self) {
        metrics::record_pending_delta(-1.0);
    }
}
