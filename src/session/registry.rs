//! Live session registry.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

use super::connection::{SendError, Session};
use super::stats::StatisticsSnapshot;
use super::{SessionEnd, SessionKey};
use crate::config::RelayConfig;
use crate::directory::Directory;
use crate::net::FrameSink;
use crate::protocol::{Codec, Envelope, RawContent};

/// Why an authorization attempt failed. Kept for logging only: callers on
/// the wire see one generic denial.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthorizationError {
    #[error("unknown identity")]
    UnknownIdentity,
    #[error("bad password")]
    BadPassword,
    #[error("identity is locked")]
    Locked,
    #[error("unknown channel")]
    UnknownChannel,
    #[error("session limit of {limit} reached")]
    Exhausted { limit: usize },
}

impl AuthorizationError {
    /// Label for logs and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            AuthorizationError::UnknownIdentity => "unknown_identity",
            AuthorizationError::BadPassword => "bad_password",
            AuthorizationError::Locked => "locked",
            AuthorizationError::UnknownChannel => "unknown_channel",
            AuthorizationError::Exhausted { .. } => "exhausted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no live session for {target}")]
pub struct SessionNotFound {
    pub target: String,
}

impl SessionNotFound {
    fn new(target: impl Into<String>) -> Self {
        Self { target: target.into() }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RawSendError {
    #[error(transparent)]
    NotFound(#[from] SessionNotFound),
    #[error(transparent)]
    Send(#[from] SendError),
}

/// Registry tunables.
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// 0 = unbounded.
    pub max_sessions: usize,
    pub liveness_timeout: Duration,
    pub sweep_interval: Duration,
    /// 0 = unbounded.
    pub max_pending_per_session: usize,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            max_sessions: 0,
            liveness_timeout: Duration::from_secs(90),
            sweep_interval: Duration::from_secs(15),
            max_pending_per_session: 0,
        }
    }
}

impl RegistryOptions {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            max_sessions: config.sessions.max_sessions,
            liveness_timeout: Duration::from_secs(config.sessions.liveness_timeout_secs),
            sweep_interval: Duration::from_secs(config.sessions.sweep_interval_secs),
            max_pending_per_session: config.rpc.max_pending_per_session,
        }
    }
}

/// Statistics of one live session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: u64,
    pub identity: String,
    pub channel: String,
    pub statistics: StatisticsSnapshot,
}

/// Maps (identity, channel) to the one live session for that key.
#[derive(Debug)]
pub struct SessionRegistry {
    directory: Arc<Directory>,
    sessions: DashMap<SessionKey, Arc<Session>>,
    codec: Codec,
    options: RegistryOptions,
}

impl SessionRegistry {
    pub fn new(directory: Arc<Directory>, codec: Codec, options: RegistryOptions) -> Self {
        Self {
            directory,
            sessions: DashMap::new(),
            codec,
            options,
        }
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    /// Validate credentials and install a session for the resolved key,
    /// superseding whatever session held it.
    pub async fn authorize(
        &self,
        identity_key: &str,
        password: &str,
        channel_key: Option<&str>,
        sink: Arc<dyn FrameSink>,
    ) -> Result<Arc<Session>, AuthorizationError> {
        let identity = self
            .directory
            .resolve(identity_key)
            .await
            .ok_or(AuthorizationError::UnknownIdentity)?;

        let verified = {
            let directory = Arc::clone(&self.directory);
            let identity = Arc::clone(&identity);
            let password = password.to_owned();
            tokio::task::spawn_blocking(move || directory.authenticate(&identity, &password))
                .await
                .unwrap_or(false)
        };
        if !verified {
            return Err(AuthorizationError::BadPassword);
        }
        if identity.is_locked {
            return Err(AuthorizationError::Locked);
        }

        let channel = self
            .directory
            .resolve_channel(&identity, channel_key)
            .ok_or(AuthorizationError::UnknownChannel)?;
        let key = SessionKey::new(&identity.key, &channel.key);

        let limit = self.options.max_sessions;
        if limit > 0 && self.sessions.len() >= limit && !self.sessions.contains_key(&key) {
            return Err(AuthorizationError::Exhausted { limit });
        }

        let session = Arc::new(Session::new(
            key.clone(),
            sink,
            self.codec,
            self.options.max_pending_per_session,
        ));
        let previous = self.sessions.insert(key, Arc::clone(&session));

        tracing::info!(
            session_id = %session.id(),
            identity = %session.key().identity,
            channel = %session.key().channel,
            superseded = previous.as_ref().map(|p| p.id().as_u64()),
            "Session authorized"
        );
        if let Some(previous) = previous {
            previous.close(SessionEnd::Superseded).await;
        }
        Ok(session)
    }

    /// Find the live session for an identity and channel (default channel
    /// when `channel_key` is `None`).
    pub async fn lookup(&self, identity_key: &str, channel_key: Option<&str>) -> Result<Arc<Session>, SessionNotFound> {
        let target = || match channel_key {
            Some(channel) => format!("{identity_key}/{channel}"),
            None => identity_key.to_string(),
        };
        let identity = self
            .directory
            .resolve(identity_key)
            .await
            .ok_or_else(|| SessionNotFound::new(target()))?;
        let channel = self
            .directory
            .resolve_channel(&identity, channel_key)
            .ok_or_else(|| SessionNotFound::new(target()))?;
        self.lookup_key(&SessionKey::new(&identity.key, &channel.key))
    }

    pub fn lookup_key(&self, key: &SessionKey) -> Result<Arc<Session>, SessionNotFound> {
        self.sessions
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|session| !session.is_closed())
            .ok_or_else(|| SessionNotFound::new(key.to_string()))
    }

    /// Close `session` and drop it from the map if it is still the occupant
    /// of its key. Returns whether the map entry was removed.
    pub async fn remove(&self, session: &Session, end: SessionEnd) -> bool {
        session.close(end).await;
        self.sessions
            .remove_if(session.key(), |_, current| current.id() == session.id())
            .is_some()
    }

    /// Remove every session whose last liveness signal is older than the
    /// configured timeout.
    pub async fn sweep_expired(&self) -> usize {
        let timeout = self.options.liveness_timeout;
        let expired: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_for() > timeout)
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for session in &expired {
            tracing::warn!(
                session_id = %session.id(),
                identity = %session.key().identity,
                channel = %session.key().channel,
                idle_secs = session.idle_for().as_secs(),
                "Session missed its liveness deadline"
            );
            self.remove(session, SessionEnd::LivenessExpired).await;
        }
        expired.len()
    }

    /// Periodically evict sessions that stopped proving liveness.
    pub async fn run_liveness_sweeper(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.options.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = self.sweep_expired().await;
                    if evicted > 0 {
                        tracing::debug!(evicted, live = self.len(), "Liveness sweep finished");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!("Liveness sweeper stopping");
                    break;
                }
            }
        }
    }

    /// Push a fire-and-forget raw message to a session.
    pub async fn send_raw(
        &self,
        identity_key: &str,
        channel_key: Option<&str>,
        content: RawContent,
    ) -> Result<(), RawSendError> {
        let session = self.lookup(identity_key, channel_key).await?;
        session.send(&Envelope::raw(content)).await?;
        Ok(())
    }

    pub fn statistics(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|entry| {
                let session = entry.value();
                SessionSummary {
                    session_id: session.id().as_u64(),
                    identity: session.key().identity.clone(),
                    channel: session.key().channel.clone(),
                    statistics: session.stats().snapshot(),
                }
            })
            .collect();
        summaries.sort_by(|a, b| (&a.identity, &a.channel).cmp(&(&b.identity, &b.channel)));
        summaries
    }

    /// Zero the channel statistics of the live session at `key`.
    pub fn reset_statistics(&self, key: &SessionKey) -> Result<(), SessionNotFound> {
        let session = self.lookup_key(key)?;
        session.stats().reset();
        tracing::debug!(session_id = %session.id(), identity = %key.identity, channel = %key.channel, "Statistics reset");
        Ok(())
    }

    /// Close and remove every session.
    pub async fn close_all(&self, end: SessionEnd) -> usize {
        let sessions: Vec<Arc<Session>> = self.sessions.iter().map(|e| Arc::clone(e.value())).collect();
        for session in &sessions {
            self.remove(session, end).await;
        }
        sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
