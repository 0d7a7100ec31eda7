//! In-process transport, used by tests and embedders that run agent and relay
//! in one process.

use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::transport::{CloseReason, FrameSink, FrameSource, TransportError};

/// Writing end of an in-memory connection.
#[derive(Debug)]
pub struct MemorySink {
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
}

/// Reading end of an in-memory connection.
#[derive(Debug)]
pub struct MemorySource {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

/// One side of a connected pair.
pub type MemoryEnd = (MemorySink, MemorySource);

/// Two connected ends: frames sent on one side are received on the other.
/// Closing either sink ends the peer's source.
pub fn pair() -> (MemoryEnd, MemoryEnd) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        (MemorySink { tx: Mutex::new(Some(a_tx)) }, MemorySource { rx: b_rx }),
        (MemorySink { tx: Mutex::new(Some(b_tx)) }, MemorySource { rx: a_rx }),
    )
}

impl MemorySink {
    fn sender(&self) -> Option<mpsc::UnboundedSender<Bytes>> {
        self.tx.lock().ok().and_then(|guard| guard.clone())
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        self.try_send(frame)
    }

    fn try_send(&self, frame: Bytes) -> Result<(), TransportError> {
        let tx = self.sender().ok_or(TransportError::Closed)?;
        tx.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn close(&self, reason: CloseReason) {
        let taken = self.tx.lock().ok().and_then(|mut guard| guard.take());
        if taken.is_some() {
            tracing::trace!(code = reason.code, reason = reason.reason, "Memory transport closed");
        }
    }
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn receive(&mut self) -> Option<Result<Bytes, TransportError>> {
        self.rx.recv().await.map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_cross_over() {
        let ((a_sink, mut a_source), (b_sink, mut b_source)) = pair();
        a_sink.send(Bytes::from_static(b"to-b")).await.unwrap();
        b_sink.send(Bytes::from_static(b"to-a")).await.unwrap();

        assert_eq!(b_source.receive().await.unwrap().unwrap(), "to-b");
        assert_eq!(a_source.receive().await.unwrap().unwrap(), "to-a");
    }

    #[tokio::test]
    async fn close_ends_peer_source() {
        let ((a_sink, _a_source), (_b_sink, mut b_source)) = pair();
        a_sink.close(CloseReason::NORMAL).await;
        a_sink.close(CloseReason::NORMAL).await;

        assert!(b_source.receive().await.is_none());
        assert!(matches!(
            a_sink.send(Bytes::new()).await,
            Err(TransportError::Closed)
        ));
    }
}
