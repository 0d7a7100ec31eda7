//! Inbound dispatcher: the single reader of a session's transport.

use std::sync::Arc;

use super::connection::Session;
use super::registry::SessionRegistry;
use super::SessionEnd;
use crate::net::FrameSource;
use crate::observability::metrics;
use crate::protocol::{CodecError, Content, Envelope, MessageType};
use crate::rpc::RpcError;

/// Read frames until the transport closes, the session is terminated
/// elsewhere, or the agent sends `max_malformed` bad envelopes in a row
/// (0 disables the limit). The session is always removed on exit.
pub async fn run_dispatcher<S: FrameSource>(
    registry: Arc<SessionRegistry>,
    session: Arc<Session>,
    mut source: S,
    max_malformed: u32,
) {
    let mut malformed_streak = 0u32;

    let end = loop {
        let next = tokio::select! {
            end = session.terminated() => break end,
            next = source.receive() => next,
        };

        let bytes = match next {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                session.stats().record_receive_error();
                tracing::debug!(session_id = %session.id(), error = %e, "Session transport failed");
                break SessionEnd::Disconnected;
            }
            None => break SessionEnd::Disconnected,
        };
        session.stats().record_received(bytes.len());

        match handle_frame(&session, &bytes).await {
            Ok(()) => malformed_streak = 0,
            Err(e) => {
                malformed_streak += 1;
                session.stats().record_malformed();
                metrics::record_malformed(malformed_tag(&e));
                tracing::warn!(
                    session_id = %session.id(),
                    identity = %session.key().identity,
                    channel = %session.key().channel,
                    error = %e,
                    streak = malformed_streak,
                    "Dropped malformed envelope"
                );
                if max_malformed > 0 && malformed_streak >= max_malformed {
                    break SessionEnd::ProtocolViolation;
                }
            }
        }
    };

    registry.remove(&session, end).await;
}

async fn handle_frame(session: &Session, bytes: &[u8]) -> Result<(), CodecError> {
    let frame = session.codec().decode_frame(bytes)?;
    match frame.message_type()? {
        MessageType::Ping => {
            frame.into_envelope(MessageType::Ping)?;
            session.touch();
            // Never wait on the write path here: this task is the only reader.
            if let Err(e) = session.try_send(&Envelope::ping()) {
                tracing::debug!(session_id = %session.id(), error = %e, "Failed to answer ping");
            }
            Ok(())
        }
        MessageType::RpcResponse => {
            let correlation_id = frame.correlation_id();
            let envelope = match frame.into_envelope(MessageType::RpcResponse) {
                Ok(envelope) => envelope,
                Err(e) => {
                    // Fail the waiting caller now instead of letting it time out.
                    if let Some(id) = correlation_id {
                        session.pending().complete(id, Err(RpcError::Malformed(e.to_string())));
                    }
                    return Err(e);
                }
            };
            session.touch();
            if let (Some(id), Content::RpcResponse(response)) = (envelope.correlation_id, envelope.content) {
                if !session.pending().complete(id, Ok(response)) {
                    metrics::record_unmatched_response();
                    tracing::debug!(
                        session_id = %session.id(),
                        correlation_id = %id,
                        "Discarded response for unknown or expired correlation id"
                    );
                }
            }
            Ok(())
        }
        MessageType::Raw => {
            let envelope = frame.into_envelope(MessageType::Raw)?;
            session.touch();
            if let Content::Raw(raw) = envelope.content {
                tracing::debug!(
                    session_id = %session.id(),
                    kind = %raw.kind,
                    bytes = raw.data.len(),
                    "Received raw message"
                );
                metrics::record_raw_message(raw.kind);
            }
            Ok(())
        }
        other @ (MessageType::Authorize | MessageType::RpcRequest) => Err(CodecError::Unexpected(other)),
    }
}

fn malformed_tag(error: &CodecError) -> String {
    match error {
        CodecError::TagMismatch { actual, .. } => actual.to_string(),
        CodecError::Unexpected(tag) => tag.to_string(),
        CodecError::Correlation { tag, .. } | CodecError::Content { tag, .. } => tag.to_string(),
        CodecError::UnknownTag(_) => "unknown".to_string(),
        _ => "frame".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use bytes::Bytes;

    use crate::directory::{ChannelRecord, Directory, IdentityRecord, MemoryIdentityStore};
    use crate::net::memory::{self, MemorySink, MemorySource};
    use crate::net::FrameSink;
    use crate::protocol::{Codec, HttpRequestContent, HttpResponseContent, RawContent};
    use crate::rpc;
    use crate::session::RegistryOptions;

    struct Harness {
        registry: Arc<SessionRegistry>,
        session: Arc<Session>,
        agent_sink: MemorySink,
        agent_source: MemorySource,
        dispatcher: tokio::task::JoinHandle<()>,
    }

    async fn harness(max_malformed: u32) -> Harness {
        let store = MemoryIdentityStore::new();
        store.insert(
            "alice",
            IdentityRecord::with_password("secret").with_channel("home", ChannelRecord::default_channel()),
        );
        let directory = Arc::new(Directory::new(Arc::new(store)));
        let registry = Arc::new(SessionRegistry::new(directory, Codec::default(), RegistryOptions::default()));

        let ((relay_sink, relay_source), (agent_sink, agent_source)) = memory::pair();
        let session = registry
            .authorize("alice", "secret", None, Arc::new(relay_sink))
            .await
            .unwrap();
        let dispatcher = tokio::spawn(run_dispatcher(
            Arc::clone(&registry),
            Arc::clone(&session),
            relay_source,
            max_malformed,
        ));
        Harness {
            registry,
            session,
            agent_sink,
            agent_source,
            dispatcher,
        }
    }

    async fn send(sink: &MemorySink, envelope: Envelope) {
        sink.send(Codec::default().encode(&envelope).unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn ping_is_answered() {
        let mut h = harness(0).await;
        send(&h.agent_sink, Envelope::ping()).await;

        let bytes = h.agent_source.receive().await.unwrap().unwrap();
        assert!(Codec::default().decode(&bytes, MessageType::Ping).is_ok());
    }

    #[tokio::test]
    async fn responses_complete_pending_calls() {
        let mut h = harness(0).await;
        let caller = {
            let session = Arc::clone(&h.session);
            tokio::spawn(async move {
                rpc::call(&session, HttpRequestContent::new("GET", "/lights"), Duration::from_secs(5)).await
            })
        };

        let bytes = h.agent_source.receive().await.unwrap().unwrap();
        let request = Codec::default().decode(&bytes, MessageType::RpcRequest).unwrap();
        let id = request.correlation_id.unwrap();
        // A duplicate must be ignored without disturbing the session.
        send(&h.agent_sink, Envelope::rpc_response(id, HttpResponseContent::new(204))).await;
        send(&h.agent_sink, Envelope::rpc_response(id, HttpResponseContent::new(500))).await;

        assert_eq!(caller.await.unwrap().unwrap().status_code(), 204);
        send(&h.agent_sink, Envelope::ping()).await;
        h.agent_source.receive().await.unwrap().unwrap();
        assert!(!h.session.is_closed());
    }

    #[tokio::test]
    async fn transport_close_removes_session_and_fails_calls() {
        let h = harness(0).await;
        let caller = {
            let session = Arc::clone(&h.session);
            tokio::spawn(async move {
                rpc::call(&session, HttpRequestContent::new("GET", "/"), Duration::from_secs(3600)).await
            })
        };
        while h.session.pending().is_empty() {
            tokio::task::yield_now().await;
        }

        drop(h.agent_sink);
        h.dispatcher.await.unwrap();

        assert!(matches!(caller.await.unwrap(), Err(RpcError::ConnectionClosed)));
        assert_eq!(h.session.end(), Some(SessionEnd::Disconnected));
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn isolated_garbage_is_tolerated() {
        let mut h = harness(3).await;
        h.agent_sink.send(Bytes::from_static(b"\xff\xfe garbage")).await.unwrap();
        send(&h.agent_sink, Envelope::ping()).await;

        h.agent_source.receive().await.unwrap().unwrap();
        assert!(!h.session.is_closed());
        assert_eq!(h.session.stats().snapshot().malformed_messages_received, 1);
    }

    #[tokio::test]
    async fn repeated_malformed_envelopes_tear_down_session() {
        let h = harness(2).await;
        send(&h.agent_sink, Envelope::rpc_request(rpc_id(), HttpRequestContent::new("GET", "/"))).await;
        send(&h.agent_sink, Envelope::raw(RawContent::new("ok", Vec::new()))).await;
        h.agent_sink.send(Bytes::from_static(b"junk")).await.unwrap();
        h.agent_sink.send(Bytes::from_static(b"junk")).await.unwrap();

        h.dispatcher.await.unwrap();
        assert_eq!(h.session.end(), Some(SessionEnd::ProtocolViolation));
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn dispatcher_stops_when_session_superseded() {
        let h = harness(0).await;
        let (replacement_sink, _) = memory::pair().0;
        let replacement = h
            .registry
            .authorize("alice", "secret", None, Arc::new(replacement_sink))
            .await
            .unwrap();

        h.dispatcher.await.unwrap();
        assert_eq!(h.session.end(), Some(SessionEnd::Superseded));
        assert_eq!(h.registry.lookup("alice", None).await.unwrap().id(), replacement.id());
    }

    /// Sink whose outbound queue never drains.
    struct FullSink;

    #[async_trait::async_trait]
    impl FrameSink for FullSink {
        async fn send(&self, _frame: Bytes) -> Result<(), crate::net::TransportError> {
            std::future::pending().await
        }

        fn try_send(&self, _frame: Bytes) -> Result<(), crate::net::TransportError> {
            Err(crate::net::TransportError::Full)
        }

        async fn close(&self, _reason: crate::net::CloseReason) {}
    }

    #[tokio::test]
    async fn ping_reply_never_blocks_the_reader() {
        let h = harness(0).await;
        let ((_, relay_source), (agent_sink, _agent_source)) = memory::pair();
        let session = h
            .registry
            .authorize("alice", "secret", None, Arc::new(FullSink))
            .await
            .unwrap();
        tokio::spawn(run_dispatcher(Arc::clone(&h.registry), Arc::clone(&session), relay_source, 0));

        let (guard, rx) = session.pending().register().unwrap();
        send(&agent_sink, Envelope::ping()).await;
        send(&agent_sink, Envelope::rpc_response(guard.id(), HttpResponseContent::new(200))).await;

        let result = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .expect("response must be dispatched behind the unanswered ping")
            .unwrap();
        assert_eq!(result.unwrap().status_code(), 200);
        assert_eq!(session.stats().snapshot().send_errors, 1);
    }

    fn rpc_id() -> crate::protocol::CorrelationId {
        crate::protocol::CorrelationId::new()
    }
}
