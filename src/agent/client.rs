//! Agent runtime: keeps one authorized session open to the relay and
//! answers forwarded requests through a [`LocalHttpHandler`].

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::Instant;

use super::handler::LocalHttpHandler;
use crate::config::AgentConfig;
use crate::net::transport::{CLOSE_SUPERSEDED, CLOSE_UNAUTHORIZED};
use crate::net::websocket::{self, ClientClose, ClientSink};
use crate::net::{CloseReason, FrameSink, TransportError};
use crate::protocol::{
    AuthorizeContent, Codec, CodecError, Content, CorrelationId, Envelope, HttpRequestContent, HttpResponseContent,
    MessageType, RawContent,
};
use crate::resilience::backoff::calculate_backoff;

/// How long the relay has to acknowledge `authorize`.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Missed ping answers tolerated before the connection is considered dead.
const MISSED_PINGS: u32 = 3;

pub type RawHandler = Arc<dyn Fn(RawContent) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to connect to relay: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("relay rejected the credentials")]
    Unauthorized,
    #[error("relay closed the connection ({})", describe_close(.0))]
    Closed(ClientClose),
    #[error("relay did not acknowledge authorization within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("relay stopped answering pings")]
    LivenessLost,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

fn describe_close(close: &ClientClose) -> String {
    match close {
        Some((code, reason)) => format!("code {code}: {reason}"),
        None => "no close frame".to_string(),
    }
}

/// How an established session ended.
#[derive(Debug)]
enum Exit {
    Shutdown,
    Closed(ClientClose),
}

pub struct Agent {
    config: AgentConfig,
    handler: Arc<dyn LocalHttpHandler>,
    raw_handlers: DashMap<String, RawHandler>,
    codec: Codec,
}

impl Agent {
    pub fn new(config: AgentConfig, handler: impl LocalHttpHandler) -> Self {
        Self {
            config,
            handler: Arc::new(handler),
            raw_handlers: DashMap::new(),
            codec: Codec::default(),
        }
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Register a handler for raw messages of `kind`, replacing any previous one.
    pub fn on_raw<F>(&self, kind: impl Into<String>, handler: F)
    where
        F: Fn(RawContent) + Send + Sync + 'static,
    {
        self.raw_handlers.insert(kind.into(), Arc::new(handler));
    }

    /// Connect, serve, and reconnect with backoff until `shutdown` fires.
    ///
    /// A session superseded by another agent for the same key is not
    /// re-established; two agents would otherwise take the key from each
    /// other forever.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut attempt = 0u32;
        loop {
            match self.connect_once(&mut shutdown).await {
                Ok(Exit::Shutdown) => break,
                Ok(Exit::Closed(Some((CLOSE_SUPERSEDED, _)))) => {
                    tracing::warn!(identity = %self.config.identity, channel = ?self.config.channel, "Superseded by another agent, not reconnecting");
                    break;
                }
                Ok(Exit::Closed(close)) => {
                    tracing::warn!(close = %describe_close(&close), "Relay session ended");
                    attempt = 0;
                }
                Err(e @ AgentError::Unauthorized) => {
                    tracing::error!(error = %e, identity = %self.config.identity, "Agent authorization rejected");
                }
                Err(e) => tracing::warn!(error = %e, attempt, "Relay connection failed"),
            }

            attempt = attempt.saturating_add(1);
            let delay = calculate_backoff(attempt, self.config.reconnect_base_ms, self.config.reconnect_max_ms);
            tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting to relay");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.recv() => break,
            }
        }
        tracing::info!("Agent stopped");
    }

    async fn connect_once(&self, shutdown: &mut broadcast::Receiver<()>) -> Result<Exit, AgentError> {
        let (stream, _) = tokio_tungstenite::connect_async(self.config.relay_url.as_str()).await?;
        let (sink, mut source) = websocket::split_client(stream);
        let sink = Arc::new(sink);

        let authorize = Envelope::authorize(AuthorizeContent {
            identity_key: self.config.identity.clone(),
            password: self.config.password.clone(),
            channel_key: self.config.channel.clone(),
        });
        sink.send(self.codec.encode(&authorize)?).await?;

        let ack = tokio::time::timeout(HANDSHAKE_TIMEOUT, source.receive_or_close())
            .await
            .map_err(|_| AgentError::HandshakeTimeout(HANDSHAKE_TIMEOUT))?;
        match ack {
            Ok(bytes) => {
                self.codec.decode(&bytes, MessageType::Ping)?;
            }
            Err(Some((CLOSE_UNAUTHORIZED, _))) => return Err(AgentError::Unauthorized),
            Err(close) => return Err(AgentError::Closed(close)),
        }
        tracing::info!(
            relay_url = %self.config.relay_url,
            identity = %self.config.identity,
            channel = ?self.config.channel,
            "Relay session established"
        );

        let ping_interval = Duration::from_secs(self.config.ping_interval_secs);
        let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
        let mut last_seen = Instant::now();
        let mut requests = JoinSet::new();

        let exit = loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    sink.close(CloseReason::GOING_AWAY).await;
                    break Ok(Exit::Shutdown);
                }
                _ = ping.tick() => {
                    if last_seen.elapsed() > ping_interval * MISSED_PINGS {
                        sink.close(CloseReason::LIVENESS).await;
                        break Err(AgentError::LivenessLost);
                    }
                    let frame = self.codec.encode(&Envelope::ping())?;
                    match sink.try_send(frame) {
                        Ok(()) => {}
                        Err(TransportError::Full) => tracing::debug!("Send queue full, skipping ping"),
                        Err(e) => break Err(e.into()),
                    }
                }
                frame = source.receive_or_close() => match frame {
                    Ok(bytes) => {
                        last_seen = Instant::now();
                        self.handle_frame(&bytes, &sink, &mut requests);
                    }
                    Err(close) => break Ok(Exit::Closed(close)),
                },
                Some(joined) = requests.join_next(), if !requests.is_empty() => {
                    if let Err(e) = joined {
                        tracing::warn!(error = %e, "Request task failed");
                    }
                }
            }
        };

        // In-flight requests die with the connection they would answer on.
        requests.abort_all();
        exit
    }

    fn handle_frame(&self, bytes: &[u8], sink: &Arc<ClientSink>, requests: &mut JoinSet<()>) {
        let frame = match self.codec.decode_frame(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "Dropped malformed frame from relay");
                return;
            }
        };

        let result = match frame.message_type() {
            Ok(MessageType::Ping) => frame.into_envelope(MessageType::Ping).map(drop),
            Ok(MessageType::RpcRequest) => frame.into_envelope(MessageType::RpcRequest).map(|envelope| {
                if let (Some(id), Content::RpcRequest(request)) = (envelope.correlation_id, envelope.content) {
                    self.spawn_request(id, request, sink, requests);
                }
            }),
            Ok(MessageType::Raw) => frame.into_envelope(MessageType::Raw).map(|envelope| {
                if let Content::Raw(raw) = envelope.content {
                    self.dispatch_raw(raw);
                }
            }),
            Ok(other) => Err(CodecError::Unexpected(other)),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "Dropped malformed envelope from relay");
        }
    }

    fn spawn_request(
        &self,
        id: CorrelationId,
        request: HttpRequestContent,
        sink: &Arc<ClientSink>,
        requests: &mut JoinSet<()>,
    ) {
        let handler = Arc::clone(&self.handler);
        let sink = Arc::clone(sink);
        let codec = self.codec;
        requests.spawn(async move {
            let method = request.method.clone();
            let uri = request.uri.clone();
            let response = match handler.handle(request).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(correlation_id = %id, method = %method, uri = %uri, error = %e, "Local handler failed");
                    HttpResponseContent::new(502).with_body(e.to_string())
                }
            };
            tracing::debug!(correlation_id = %id, method = %method, uri = %uri, status = response.status_code(), "Answering forwarded request");

            let frame = match codec.encode(&Envelope::rpc_response(id, response)) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(correlation_id = %id, error = %e, "Failed to encode response");
                    return;
                }
            };
            if let Err(e) = sink.send(frame).await {
                tracing::debug!(correlation_id = %id, error = %e, "Failed to send response");
            }
        });
    }

    fn dispatch_raw(&self, raw: RawContent) {
        let handler = self.raw_handlers.get(&raw.kind).map(|h| Arc::clone(h.value()));
        match handler {
            Some(handler) => handler(raw),
            None => tracing::debug!(kind = %raw.kind, "No handler for raw message"),
        }
    }
}
