//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Build the Axum router: agent connector plus catch-all front door
//! - Wire up middleware (request id, tracing, body limit, timeout)
//! - Own the session registry and its liveness sweeper
//! - Serve plain TCP or TLS, draining sessions on shutdown

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{any, get},
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use super::connector::connector_handler;
use super::forward::forward;
use crate::config::RelayConfig;
use crate::directory::{Directory, FileIdentityStore};
use crate::session::{RegistryOptions, SessionEnd, SessionRegistry};

/// Slack between the forward deadline and the outer request timeout, so the
/// handler answers 504 itself.
const TIMEOUT_SLACK: Duration = Duration::from_secs(5);

/// Time given to in-flight public requests once shutdown starts.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub rpc_timeout: Duration,
    pub handshake_timeout: Duration,
    pub max_body_bytes: usize,
    pub max_frame_bytes: usize,
    pub max_malformed: u32,
}

/// The relay: public front door plus agent connector.
pub struct RelayServer {
    router: Router,
    registry: Arc<SessionRegistry>,
    config: RelayConfig,
}

impl RelayServer {
    /// Relay backed by the file identity store named in the config.
    pub fn new(config: RelayConfig) -> Self {
        let store = Arc::new(FileIdentityStore::new(&config.directory.root));
        let directory = Directory::new(store)
            .with_cache(config.directory.cache_enabled)
            .with_credential_ttl(Duration::from_secs(config.directory.credential_cache_secs));
        Self::with_directory(config, Arc::new(directory))
    }

    pub fn with_directory(config: RelayConfig, directory: Arc<Directory>) -> Self {
        let registry = Arc::new(SessionRegistry::new(
            directory,
            config.codec.codec(),
            RegistryOptions::from_config(&config),
        ));

        let state = AppState {
            registry: Arc::clone(&registry),
            rpc_timeout: Duration::from_secs(config.rpc.request_timeout_secs),
            handshake_timeout: Duration::from_secs(config.sessions.handshake_timeout_secs),
            max_body_bytes: config.listener.max_body_bytes,
            max_frame_bytes: config.listener.max_frame_bytes,
            max_malformed: config.sessions.max_consecutive_malformed,
        };

        let router = Self::build_router(&config, state);
        Self {
            router,
            registry,
            config,
        }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(config: &RelayConfig, state: AppState) -> Router {
        let request_timeout = Duration::from_secs(config.rpc.request_timeout_secs) + TIMEOUT_SLACK;
        Router::new()
            .route(&config.listener.connector_path, get(connector_handler))
            .route("/{*path}", any(forward))
            .route("/", any(forward))
            .with_state(state)
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                    .layer(PropagateRequestIdLayer::x_request_id())
                    .layer(TraceLayer::new_for_http())
                    .layer(RequestBodyLimitLayer::new(config.listener.max_body_bytes))
                    .layer(TimeoutLayer::new(request_timeout)),
            )
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Serve on `listener` until `shutdown` fires.
    pub async fn run(self, listener: TcpListener, shutdown: broadcast::Receiver<()>) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            connector_path = %self.config.listener.connector_path,
            "Relay listening"
        );

        tokio::spawn(Arc::clone(&self.registry).run_liveness_sweeper(shutdown.resubscribe()));

        let registry = Arc::clone(&self.registry);
        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(drain_on(shutdown, registry))
            .await?;

        tracing::info!("Relay stopped");
        Ok(())
    }

    /// Serve TLS on `addr` until `shutdown` fires.
    pub async fn run_tls(
        self,
        addr: SocketAddr,
        tls: RustlsConfig,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        tracing::info!(
            address = %addr,
            connector_path = %self.config.listener.connector_path,
            "Relay listening (TLS)"
        );

        tokio::spawn(Arc::clone(&self.registry).run_liveness_sweeper(shutdown.resubscribe()));

        let handle = axum_server::Handle::new();
        let drain = drain_on(shutdown, Arc::clone(&self.registry));
        let shutdown_handle = handle.clone();
        tokio::spawn(async move {
            drain.await;
            shutdown_handle.graceful_shutdown(Some(DRAIN_TIMEOUT));
        });

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum_server::bind_rustls(addr, tls).handle(handle).serve(app).await?;

        tracing::info!("Relay stopped");
        Ok(())
    }
}

/// Resolves once shutdown fires, after every session has been closed so
/// pending requests fail immediately.
async fn drain_on(mut shutdown: broadcast::Receiver<()>, registry: Arc<SessionRegistry>) {
    let _ = shutdown.recv().await;
    let closed = registry.close_all(SessionEnd::Shutdown).await;
    tracing::info!(sessions = closed, "Shutdown signal received, sessions closed");
}
