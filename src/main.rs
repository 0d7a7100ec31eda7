//! Hub relay
//!
//! Exposes HTTP endpoints of hubs that sit behind NAT. Each hub runs an agent
//! that keeps a WebSocket session open to the relay; public requests are
//! wrapped in envelopes, correlated, and answered over that session.
//!
//! # Architecture Overview
//!
//! ```text
//!                      ┌───────────────────────────────────────────────┐
//!                      │                    RELAY                       │
//!   Public request     │  ┌─────────┐   ┌────────────┐   ┌─────────┐   │
//!   ───────────────────┼─▶│  http   │──▶│ addressing │──▶│   rpc   │───┼──┐
//!                      │  │ forward │   │ directory  │   │ pending │   │  │
//!                      │  └─────────┘   └────────────┘   └─────────┘   │  │ rpc-request
//!                      │                                               │  ▼
//!                      │  ┌──────────────────────────┐   ┌─────────┐   │ ┌───────┐
//!                      │  │ session registry         │◀──│connector│◀──┼─│ agent │─▶ local HTTP
//!                      │  │ supersession / liveness  │   │  (ws)   │   │ └───────┘
//!                      │  └──────────────────────────┘   └─────────┘   │
//!                      └───────────────────────────────────────────────┘
//! ```

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use hub_relay::config::{load_config, RelayConfig};
use hub_relay::directory::password::hash_password;
use hub_relay::lifecycle::{signals::shutdown_on_signal, startup, Shutdown};
use hub_relay::observability::logging::init_logging;

#[derive(Parser)]
#[command(name = "hub-relay")]
#[command(about = "Relay public HTTP traffic to hubs behind NAT", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server
    Serve {
        #[arg(short, long, default_value = "relay.toml")]
        config: PathBuf,
    },
    /// Run an agent that serves a local HTTP endpoint through the relay
    Agent {
        #[arg(short, long, default_value = "agent.toml")]
        config: PathBuf,
    },
    /// Print an argon2 hash for an identity record
    HashPassword { password: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let (config_path, agent) = match cli.command {
        Commands::HashPassword { password } => {
            let hash = hash_password(&password).map_err(|e| e.to_string())?;
            println!("{hash}");
            return Ok(());
        }
        Commands::Serve { config } => (config, false),
        Commands::Agent { config } => (config, true),
    };

    let config = read_config(&config_path)?;
    init_logging(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "hub-relay starting");

    let shutdown = Shutdown::new();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    if agent {
        startup::run_agent(config, &shutdown).await?;
    } else {
        startup::serve(config, &shutdown).await?;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Missing config file means defaults; anything else must parse and validate.
fn read_config(path: &Path) -> Result<RelayConfig, Box<dyn std::error::Error>> {
    if path.exists() {
        Ok(load_config(path)?)
    } else {
        eprintln!("{} not found, using defaults", path.display());
        Ok(RelayConfig::default())
    }
}
