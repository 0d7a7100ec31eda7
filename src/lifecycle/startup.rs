//! Startup orchestration.
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Listeners start last (traffic only when ready)

use std::path::Path;

use tokio::net::TcpListener;

use super::Shutdown;
use crate::agent::{Agent, HandlerError, ReqwestHandler};
use crate::config::{validate_agent_config, ConfigError, RelayConfig};
use crate::http::RelayServer;
use crate::net::tls::load_tls_config;
use crate::observability::metrics;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to load TLS material: {0}")]
    Tls(#[source] std::io::Error),
    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
    #[error("failed to build local HTTP handler: {0}")]
    Handler(#[from] HandlerError),
}

/// Run the relay until `shutdown` fires.
pub async fn serve(config: RelayConfig, shutdown: &Shutdown) -> Result<(), StartupError> {
    tracing::info!(
        bind_address = %config.listener.bind_address,
        identity_root = %config.directory.root,
        request_timeout_secs = config.rpc.request_timeout_secs,
        liveness_timeout_secs = config.sessions.liveness_timeout_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let tls = match &config.listener.tls {
        Some(tls) => Some(
            load_tls_config(Path::new(&tls.cert_path), Path::new(&tls.key_path))
                .await
                .map_err(StartupError::Tls)?,
        ),
        None => None,
    };

    let bind_address = config.listener.bind_address.clone();
    let server = RelayServer::new(config);
    match tls {
        Some(tls) => {
            let addr = bind_address.parse().map_err(|e| StartupError::Bind {
                address: bind_address.clone(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
            })?;
            server
                .run_tls(addr, tls, shutdown.subscribe())
                .await
                .map_err(StartupError::Serve)
        }
        None => {
            let listener = TcpListener::bind(&bind_address)
                .await
                .map_err(|source| StartupError::Bind {
                    address: bind_address.clone(),
                    source,
                })?;
            server
                .run(listener, shutdown.subscribe())
                .await
                .map_err(StartupError::Serve)
        }
    }
}

/// Run an agent that serves forwarded requests from its local HTTP server.
pub async fn run_agent(config: RelayConfig, shutdown: &Shutdown) -> Result<(), StartupError> {
    validate_agent_config(&config).map_err(|errors| StartupError::Config(ConfigError::Validation(errors)))?;

    let codec = config.codec.codec();
    let agent_config = config.agent;
    tracing::info!(
        relay_url = %agent_config.relay_url,
        identity = %agent_config.identity,
        channel = ?agent_config.channel,
        local_base_url = %agent_config.local_base_url,
        "Starting agent"
    );
    let handler = ReqwestHandler::new(
        &agent_config.local_base_url,
        std::time::Duration::from_secs(agent_config.local_timeout_secs),
    )?;
    let agent = Agent::new(agent_config, handler).with_codec(codec);
    agent.run(shutdown.subscribe()).await;
    Ok(())
}
