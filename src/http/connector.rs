//! Agent connector endpoint: WebSocket upgrade, handshake, dispatch.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ws::WebSocket, ConnectInfo, State, WebSocketUpgrade},
    response::IntoResponse,
};

use super::server::AppState;
use crate::net::websocket::{self, ServerSource};
use crate::net::{CloseReason, FrameSink, FrameSource, TransportError};
use crate::observability::metrics;
use crate::protocol::{AuthorizeContent, Codec, CodecError, Content, Envelope, MessageType};
use crate::session::{self, AuthorizationError, SessionEnd};

#[derive(Debug, thiserror::Error)]
enum HandshakeError {
    #[error("connection closed before authorize")]
    Closed,
    #[error("no authorize message within the handshake timeout")]
    TimedOut,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

pub async fn connector_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.max_message_size(state.max_frame_bytes)
        .on_upgrade(move |socket| handle_agent(socket, state, remote))
}

async fn handle_agent(socket: WebSocket, state: AppState, remote: SocketAddr) {
    let (sink, mut source) = websocket::split_server(socket);
    let sink: Arc<dyn FrameSink> = Arc::new(sink);
    let registry = Arc::clone(&state.registry);

    let authorize = match tokio::time::timeout(state.handshake_timeout, read_authorize(&mut source, registry.codec())).await {
        Ok(Ok(authorize)) => authorize,
        Ok(Err(e)) => return reject(&sink, remote, &e, CloseReason::UNAUTHORIZED).await,
        Err(_) => return reject(&sink, remote, &HandshakeError::TimedOut, CloseReason::UNAUTHORIZED).await,
    };

    let session = match registry
        .authorize(
            &authorize.identity_key,
            &authorize.password,
            authorize.channel_key.as_deref(),
            Arc::clone(&sink),
        )
        .await
    {
        Ok(session) => session,
        Err(e) => {
            metrics::record_authorization(e.reason());
            tracing::warn!(
                remote = %remote,
                identity = %authorize.identity_key,
                channel = ?authorize.channel_key,
                reason = e.reason(),
                "Agent authorization failed"
            );
            let close = match e {
                AuthorizationError::Exhausted { .. } => CloseReason::TRY_AGAIN_LATER,
                _ => CloseReason::UNAUTHORIZED,
            };
            sink.close(close).await;
            return;
        }
    };
    metrics::record_authorization("success");

    if let Err(e) = session.send(&Envelope::ping()).await {
        tracing::debug!(session_id = %session.id(), error = %e, "Failed to acknowledge authorization");
        registry.remove(&session, SessionEnd::Disconnected).await;
        return;
    }

    tracing::debug!(session_id = %session.id(), remote = %remote, "Agent session dispatching");
    session::run_dispatcher(registry, session, source, state.max_malformed).await;
}

async fn read_authorize(source: &mut ServerSource, codec: &Codec) -> Result<AuthorizeContent, HandshakeError> {
    let bytes = source.receive().await.ok_or(HandshakeError::Closed)??;
    let envelope = codec.decode(&bytes, MessageType::Authorize)?;
    match envelope.content {
        Content::Authorize(authorize) => Ok(authorize),
        other => Err(CodecError::Unexpected(other.message_type()).into()),
    }
}

async fn reject(sink: &Arc<dyn FrameSink>, remote: SocketAddr, error: &HandshakeError, reason: CloseReason) {
    metrics::record_authorization("handshake_failed");
    tracing::warn!(remote = %remote, error = %error, "Agent handshake failed");
    sink.close(reason).await;
}
