//! WebSocket transports.
//!
//! The relay side wraps axum's `WebSocket`; the agent side wraps a
//! `tokio-tungstenite` client stream. Both carry one envelope per binary
//! message. Text messages are a protocol error; control frames are handled by
//! the WebSocket layer. Writes go through [`QueuedSink`] on both sides.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{self, WebSocket};
use bytes::Bytes;
use futures_util::{stream::SplitStream, Sink, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{
    tungstenite::{self, protocol::frame::coding::CloseCode},
    MaybeTlsStream, WebSocketStream,
};

use super::transport::{CloseReason, FrameSink, FrameSource, TransportError};

/// Frames queued per connection before `send` starts waiting.
pub const SEND_QUEUE_CAPACITY: usize = 256;

/// How long the writer tries to deliver the close frame.
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

// ── Writer task ─────────────────────────────────────────────────────────────

/// Message type of a WebSocket implementation.
pub trait WsMessage: Send + 'static {
    fn binary(frame: Bytes) -> Self;
    fn close(reason: &CloseReason) -> Self;
}

impl WsMessage for ws::Message {
    fn binary(frame: Bytes) -> Self {
        ws::Message::Binary(frame)
    }

    fn close(reason: &CloseReason) -> Self {
        ws::Message::Close(Some(ws::CloseFrame {
            code: reason.code,
            reason: ws::Utf8Bytes::from_static(reason.reason),
        }))
    }
}

impl WsMessage for tungstenite::Message {
    fn binary(frame: Bytes) -> Self {
        tungstenite::Message::Binary(frame)
    }

    fn close(reason: &CloseReason) -> Self {
        tungstenite::Message::Close(Some(tungstenite::protocol::CloseFrame {
            code: CloseCode::from(reason.code),
            reason: tungstenite::Utf8Bytes::from_static(reason.reason),
        }))
    }
}

/// Outbound half backed by a writer task that owns the socket.
///
/// Senders only touch a bounded queue, so a peer that stops reading stalls
/// the writer task and fills the queue, never the callers' locks. `close`
/// signals the writer and returns at once.
pub struct QueuedSink<M> {
    tx: mpsc::Sender<M>,
    close: watch::Sender<Option<CloseReason>>,
    closed: AtomicBool,
}

impl<M: WsMessage> QueuedSink<M> {
    /// Spawn the writer task for `sink`.
    pub fn spawn<S>(sink: S, capacity: usize) -> Self
    where
        S: Sink<M> + Unpin + Send + 'static,
        S::Error: Display,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (close, close_rx) = watch::channel(None);
        tokio::spawn(write_loop(sink, rx, close_rx));
        Self {
            tx,
            close,
            closed: AtomicBool::new(false),
        }
    }
}

async fn write_loop<M, S>(mut sink: S, mut rx: mpsc::Receiver<M>, mut close_rx: watch::Receiver<Option<CloseReason>>)
where
    M: WsMessage,
    S: Sink<M> + Unpin,
    S::Error: Display,
{
    loop {
        let message = tokio::select! {
            biased;
            _ = close_rx.changed() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        tokio::select! {
            biased;
            _ = close_rx.changed() => break,
            result = sink.send(message) => {
                if let Err(e) = result {
                    tracing::debug!(error = %e, "WebSocket write failed");
                    return;
                }
            }
        }
    }
    // Wake senders still waiting for room.
    drop(rx);

    let reason = close_rx.borrow().clone();
    if let Some(reason) = reason {
        let delivered = tokio::time::timeout(CLOSE_FRAME_TIMEOUT, async {
            sink.send(M::close(&reason)).await?;
            sink.close().await
        })
        .await;
        match delivered {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::trace!(error = %e, "Close frame not delivered"),
            Err(_) => tracing::trace!("Close frame timed out"),
        }
    }
}

#[async_trait]
impl<M: WsMessage> FrameSink for QueuedSink<M> {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(M::binary(frame))
            .await
            .map_err(|_| TransportError::Closed)
    }

    fn try_send(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.tx.try_send(M::binary(frame)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Full,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    async fn close(&self, reason: CloseReason) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close.send_replace(Some(reason));
    }
}

// ── Relay side (axum) ───────────────────────────────────────────────────────

pub type ServerSink = QueuedSink<ws::Message>;

/// Split an accepted agent socket into sink and source.
pub fn split_server(socket: WebSocket) -> (ServerSink, ServerSource) {
    let (sink, stream) = socket.split();
    (
        QueuedSink::spawn(sink, SEND_QUEUE_CAPACITY),
        ServerSource { inner: stream },
    )
}

pub struct ServerSource {
    inner: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameSource for ServerSource {
    async fn receive(&mut self) -> Option<Result<Bytes, TransportError>> {
        loop {
            match self.inner.next().await? {
                Ok(ws::Message::Binary(data)) => return Some(Ok(data)),
                Ok(ws::Message::Text(_)) => {
                    return Some(Err(TransportError::WebSocket("unexpected text message".into())))
                }
                Ok(ws::Message::Close(_)) => return None,
                Ok(ws::Message::Ping(_)) | Ok(ws::Message::Pong(_)) => continue,
                Err(e) => return Some(Err(TransportError::WebSocket(e.to_string()))),
            }
        }
    }
}

// ── Agent side (tokio-tungstenite) ──────────────────────────────────────────

pub type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub type ClientSink = QueuedSink<tungstenite::Message>;

/// Split a connected client stream into sink and source.
pub fn split_client(stream: ClientStream) -> (ClientSink, ClientSource) {
    let (sink, stream) = stream.split();
    (
        QueuedSink::spawn(sink, SEND_QUEUE_CAPACITY),
        ClientSource { inner: stream },
    )
}

pub struct ClientSource {
    inner: SplitStream<ClientStream>,
}

/// Close code and reason of the frame that ended a client connection.
pub type ClientClose = Option<(u16, String)>;

impl ClientSource {
    /// Like [`FrameSource::receive`], but surfaces the close frame so the
    /// agent can tell a rejected handshake from a dropped connection.
    pub async fn receive_or_close(&mut self) -> Result<Bytes, ClientClose> {
        loop {
            match self.inner.next().await {
                Some(Ok(tungstenite::Message::Binary(data))) => return Ok(data),
                Some(Ok(tungstenite::Message::Close(frame))) => {
                    return Err(frame.map(|f| (u16::from(f.code), f.reason.to_string())))
                }
                Some(Ok(tungstenite::Message::Text(_))) => {
                    tracing::debug!("Ignoring unexpected text message from relay");
                    continue;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "Relay connection failed");
                    return Err(None);
                }
                None => return Err(None),
            }
        }
    }
}

#[async_trait]
impl FrameSource for ClientSource {
    async fn receive(&mut self) -> Option<Result<Bytes, TransportError>> {
        loop {
            match self.inner.next().await? {
                Ok(tungstenite::Message::Binary(data)) => return Some(Ok(data)),
                Ok(tungstenite::Message::Text(_)) => {
                    return Some(Err(TransportError::WebSocket("unexpected text message".into())))
                }
                Ok(tungstenite::Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(Err(TransportError::WebSocket(e.to_string()))),
            }
        }
    }
}
