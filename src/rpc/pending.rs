//! Pending correlation entries of one session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use dashmap::{mapref::entry::Entry, DashMap};
use tokio::sync::oneshot;

use super::RpcError;
use crate::protocol::{CorrelationId, HttpResponseContent};

/// Outcome delivered to a suspended caller.
pub type CallResult = Result<HttpResponseContent, RpcError>;

#[derive(Debug)]
struct PendingCall {
    tx: oneshot::Sender<CallResult>,
    created_at: Instant,
}

/// Correlation map for a single session.
///
/// Every entry is completed at most once: whichever of [`complete`],
/// [`cancel`] or [`close_all`] removes it from the map owns its sender.
///
/// [`complete`]: PendingCalls::complete
/// [`cancel`]: PendingCalls::cancel
/// [`close_all`]: PendingCalls::close_all
#[derive(Debug)]
pub struct PendingCalls {
    entries: DashMap<CorrelationId, PendingCall>,
    closed: AtomicBool,
    limit: usize,
}

/// Removes its entry when dropped, so a caller that times out or is aborted
/// frees the slot without waiting for a response.
#[derive(Debug)]
pub struct PendingGuard<'a> {
    calls: &'a PendingCalls,
    id: CorrelationId,
}

impl PendingGuard<'_> {
    pub fn id(&self) -> CorrelationId {
        self.id
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.calls.cancel(self.id);
    }
}

impl PendingCalls {
    /// `limit` bounds the number of simultaneously pending entries; 0 means
    /// unbounded.
    pub fn new(limit: usize) -> Self {
        Self {
            entries: DashMap::new(),
            closed: AtomicBool::new(false),
            limit,
        }
    }

    /// Register a new entry under an identifier unique among those pending.
    pub fn register(&self) -> Result<(PendingGuard<'_>, oneshot::Receiver<CallResult>), RpcError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::ConnectionClosed);
        }
        if self.limit > 0 && self.entries.len() >= self.limit {
            return Err(RpcError::Exhausted { limit: self.limit });
        }

        let (tx, rx) = oneshot::channel();
        let mut call = Some(PendingCall {
            tx,
            created_at: Instant::now(),
        });
        let id = loop {
            let id = CorrelationId::new();
            match self.entries.entry(id) {
                Entry::Vacant(slot) => {
                    if let Some(call) = call.take() {
                        slot.insert(call);
                    }
                    break id;
                }
                Entry::Occupied(_) => {
                    tracing::debug!(correlation_id = %id, "Correlation id collision, regenerating");
                }
            }
        };

        let guard = PendingGuard { calls: self, id };
        // close_all may have drained the map between the first check and the insert.
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::ConnectionClosed);
        }
        Ok((guard, rx))
    }

    /// Resolve the entry for `id`. Unknown, late and duplicate identifiers
    /// return `false` and leave the map untouched.
    pub fn complete(&self, id: CorrelationId, result: CallResult) -> bool {
        match self.entries.remove(&id) {
            Some((_, call)) => {
                tracing::trace!(
                    correlation_id = %id,
                    elapsed_ms = call.created_at.elapsed().as_millis() as u64,
                    "Correlation completed"
                );
                call.tx.send(result).is_ok()
            }
            None => false,
        }
    }

    /// Drop the entry for `id` without resolving it.
    pub fn cancel(&self, id: CorrelationId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Resolve every pending entry with [`RpcError::ConnectionClosed`] and
    /// refuse new registrations. Returns the number of entries resolved.
    pub fn close_all(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let ids: Vec<CorrelationId> = self.entries.iter().map(|e| *e.key()).collect();
        ids.into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .map(|(_, call)| {
                let _ = call.tx.send(Err(RpcError::ConnectionClosed));
            })
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[tokio::test]
    async fn complete_resolves_exactly_once() {
        let calls = PendingCalls::new(0);
        let (guard, rx) = calls.register().unwrap();
        let id = guard.id();

        assert!(calls.complete(id, Ok(HttpResponseContent::new(201))));
        assert!(!calls.complete(id, Ok(HttpResponseContent::new(500))));
        assert_eq!(rx.await.unwrap().unwrap().status_code(), 201);
    }

    #[test]
    fn unknown_ids_are_ignored() {
        let calls = PendingCalls::new(0);
        assert!(!calls.complete(CorrelationId::new(), Ok(HttpResponseContent::new(200))));
        assert!(calls.is_empty());
    }

    #[test]
    fn dropping_guard_frees_slot() {
        let calls = PendingCalls::new(0);
        let (guard, _rx) = calls.register().unwrap();
        assert_eq!(calls.len(), 1);
        drop(guard);
        assert!(calls.is_empty());
    }

    #[test]
    fn identifiers_are_unique_among_pending() {
        let calls = PendingCalls::new(0);
        let registered: Vec<_> = (0..500).map(|_| calls.register().unwrap()).collect();
        let ids: HashSet<_> = registered.iter().map(|(g, _)| g.id()).collect();
        assert_eq!(ids.len(), 500);
    }

    #[test]
    fn limit_reports_exhaustion() {
        let calls = PendingCalls::new(2);
        let _a = calls.register().unwrap();
        let _b = calls.register().unwrap();
        assert!(matches!(calls.register(), Err(RpcError::Exhausted { limit: 2 })));
    }

    #[tokio::test]
    async fn close_all_fails_every_entry() {
        let calls = PendingCalls::new(0);
        let (_g1, rx1) = calls.register().unwrap();
        let (_g2, rx2) = calls.register().unwrap();

        assert_eq!(calls.close_all(), 2);
        assert_eq!(calls.close_all(), 0);
        assert!(matches!(rx1.await.unwrap(), Err(RpcError::ConnectionClosed)));
        assert!(matches!(rx2.await.unwrap(), Err(RpcError::ConnectionClosed)));
        assert!(matches!(calls.register(), Err(RpcError::ConnectionClosed)));
    }
}
