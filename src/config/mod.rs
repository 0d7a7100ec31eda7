//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks, relay and agent separately)
//!     → RelayConfig (validated, immutable)
//!     → handed to the server or agent at startup
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AgentConfig, CodecConfig, DirectoryConfig, ListenerConfig, LogFormat, ObservabilityConfig, RelayConfig,
    RpcConfig, SessionsConfig, TlsConfig,
};
pub use validation::{validate_agent_config, validate_config, ValidationError};
