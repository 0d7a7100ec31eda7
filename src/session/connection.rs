//! A live agent session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::Instant;

use super::stats::ChannelStatistics;
use super::{SessionEnd, SessionId, SessionKey};
use crate::net::{FrameSink, TransportError};
use crate::observability::metrics;
use crate::protocol::{Codec, CodecError, Envelope};
use crate::rpc::PendingCalls;

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("session closed")]
    Closed,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// One authorized duplex connection.
///
/// Writers share the session through an `Arc`; the sink serializes their
/// frames. The inbound side is owned by the dispatcher task.
pub struct Session {
    id: SessionId,
    key: SessionKey,
    sink: Arc<dyn FrameSink>,
    codec: Codec,
    pending: PendingCalls,
    stats: ChannelStatistics,
    created_at: DateTime<Utc>,
    started: Instant,
    /// Milliseconds after `started` of the last liveness signal.
    last_liveness_ms: AtomicU64,
    terminated: watch::Sender<Option<SessionEnd>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("created_at", &self.created_at)
            .field("pending", &self.pending.len())
            .field("end", &self.end())
            .finish()
    }
}

impl Session {
    /// `max_pending` bounds simultaneously pending correlated calls (0 = unbounded).
    pub fn new(key: SessionKey, sink: Arc<dyn FrameSink>, codec: Codec, max_pending: usize) -> Self {
        let created_at = Utc::now();
        let (terminated, _) = watch::channel(None);
        metrics::record_session_opened();
        Self {
            id: SessionId::new(),
            key,
            sink,
            codec,
            pending: PendingCalls::new(max_pending),
            stats: ChannelStatistics::new(created_at),
            created_at,
            started: Instant::now(),
            last_liveness_ms: AtomicU64::new(0),
            terminated,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn pending(&self) -> &PendingCalls {
        &self.pending
    }

    pub fn stats(&self) -> &ChannelStatistics {
        &self.stats
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Record a liveness signal from the agent.
    pub fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_liveness_ms.fetch_max(now, Ordering::Relaxed);
    }

    /// Time since the last liveness signal (or since creation).
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_liveness_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    pub fn is_closed(&self) -> bool {
        self.terminated.borrow().is_some()
    }

    pub fn end(&self) -> Option<SessionEnd> {
        *self.terminated.borrow()
    }

    /// Encode `envelope` and queue it on the serialized sink, waiting while
    /// the queue is full. Callers bound the wait with their own deadline.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        let frame = self.codec.encode(envelope)?;
        let len = frame.len();
        let result = self.sink.send(frame).await;
        self.record_send(len, result)
    }

    /// Like [`send`](Self::send), but fails instead of waiting for room.
    pub fn try_send(&self, envelope: &Envelope) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        let frame = self.codec.encode(envelope)?;
        let len = frame.len();
        let result = self.sink.try_send(frame);
        self.record_send(len, result)
    }

    fn record_send(&self, len: usize, result: Result<(), TransportError>) -> Result<(), SendError> {
        match result {
            Ok(()) => {
                self.stats.record_sent(len);
                Ok(())
            }
            Err(e) => {
                self.stats.record_send_error();
                Err(e.into())
            }
        }
    }

    /// Terminate the session: fail every pending call, close the transport
    /// and wake anything waiting in [`terminated`](Self::terminated).
    /// Only the first call has any effect.
    pub async fn close(&self, end: SessionEnd) {
        let mut first = false;
        self.terminated.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(end);
            first = true;
            true
        });
        if !first {
            return;
        }

        let cancelled = self.pending.close_all();
        self.sink.close(end.close_reason()).await;
        metrics::record_session_closed(end.as_str());

        let stats = self.stats.snapshot();
        tracing::info!(
            session_id = %self.id,
            identity = %self.key.identity,
            channel = %self.key.channel,
            reason = %end,
            cancelled_calls = cancelled,
            uptime_secs = stats.uptime_secs,
            messages_sent = stats.messages_sent,
            messages_received = stats.messages_received,
            bytes_sent = stats.bytes_sent,
            bytes_received = stats.bytes_received,
            malformed_received = stats.malformed_messages_received,
            "Session closed"
        );
    }

    /// Resolves once the session has been closed.
    pub async fn terminated(&self) -> SessionEnd {
        let mut rx = self.terminated.subscribe();
        loop {
            if let Some(end) = *rx.borrow_and_update() {
                return end;
            }
            if rx.changed().await.is_err() {
                return SessionEnd::Disconnected;
            }
        }
    }
}
