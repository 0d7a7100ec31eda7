//! Configuration schema definitions.
//!
//! Every section derives Serde traits and carries defaults, so an empty file
//! is a valid relay configuration.

use serde::{Deserialize, Serialize};

/// Root configuration for relay and agent.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RelayConfig {
    /// Public listener (front door and agent connector).
    pub listener: ListenerConfig,

    /// Identity store.
    pub directory: DirectoryConfig,

    /// Session registry limits and liveness.
    pub sessions: SessionsConfig,

    /// Correlated request settings.
    pub rpc: RpcConfig,

    /// Wire codec settings.
    pub codec: CodecConfig,

    /// Logging and metrics.
    pub observability: ObservabilityConfig,

    /// Settings used by `hub-relay agent`.
    pub agent: AgentConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,

    /// Path agents connect to.
    pub connector_path: String,

    /// Largest public request body accepted, in bytes.
    pub max_body_bytes: usize,

    /// Largest WebSocket message accepted from an agent, in bytes.
    pub max_frame_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            tls: None,
            connector_path: "/_relay/connector".to_string(),
            max_body_bytes: 16 * 1024 * 1024,
            max_frame_bytes: 32 * 1024 * 1024,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Identity directory configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Root of the `<identity>/identity.json` tree.
    pub root: String,

    /// Cache resolved identities in memory.
    pub cache_enabled: bool,

    /// Seconds a successful password check is trusted (0 = always hash).
    pub credential_cache_secs: u64,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            root: "./identities".to_string(),
            cache_enabled: true,
            credential_cache_secs: 60,
        }
    }
}

/// Session registry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// Maximum live sessions (0 = unbounded).
    pub max_sessions: usize,

    /// Time an agent has to send `authorize` after connecting.
    pub handshake_timeout_secs: u64,

    /// Sessions silent for longer than this are evicted.
    pub liveness_timeout_secs: u64,

    /// How often the liveness sweeper runs.
    pub sweep_interval_secs: u64,

    /// Consecutive malformed envelopes tolerated before teardown (0 = never).
    pub max_consecutive_malformed: u32,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_sessions: 10_000,
            handshake_timeout_secs: 10,
            liveness_timeout_secs: 90,
            sweep_interval_secs: 15,
            max_consecutive_malformed: 10,
        }
    }
}

/// Correlated request configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Deadline for an agent to answer a forwarded request.
    pub request_timeout_secs: u64,

    /// Maximum in-flight requests per session (0 = unbounded).
    pub max_pending_per_session: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            max_pending_per_session: 1024,
        }
    }
}

/// Codec configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Payloads above this many bytes are deflated (0 = never).
    pub compression_threshold: usize,

    /// Largest payload accepted after decompression, in bytes.
    pub max_payload_bytes: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            compression_threshold: crate::protocol::codec::DEFAULT_COMPRESSION_THRESHOLD,
            max_payload_bytes: crate::protocol::codec::DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

impl CodecConfig {
    pub fn codec(&self) -> crate::protocol::Codec {
        crate::protocol::Codec::new(self.compression_threshold).with_max_payload(self.max_payload_bytes)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Agent configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentConfig {
    /// WebSocket URL of the relay connector.
    pub relay_url: String,

    pub identity: String,

    pub password: String,

    /// Channel to serve; the identity's default channel when unset.
    pub channel: Option<String>,

    /// Local HTTP server that answers forwarded requests.
    pub local_base_url: String,

    /// Timeout for a single local request.
    pub local_timeout_secs: u64,

    /// Interval between liveness pings.
    pub ping_interval_secs: u64,

    /// Reconnect backoff base delay.
    pub reconnect_base_ms: u64,

    /// Reconnect backoff ceiling.
    pub reconnect_max_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8080/_relay/connector".to_string(),
            identity: String::new(),
            password: String::new(),
            channel: None,
            local_base_url: "http://127.0.0.1:80".to_string(),
            local_timeout_secs: 25,
            ping_interval_secs: 30,
            reconnect_base_ms: 500,
            reconnect_max_ms: 30_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CorrelationId, Envelope, HttpResponseContent, MessageType};

    #[test]
    fn codec_section_drives_built_codec() {
        let config = CodecConfig {
            compression_threshold: 64,
            max_payload_bytes: 1024,
        };
        let envelope = Envelope::rpc_response(
            CorrelationId::new(),
            HttpResponseContent::new(200).with_body(vec![b'a'; 8 * 1024]),
        );

        let bytes = config.codec().encode(&envelope).unwrap();
        assert!(bytes.len() < 1024);
        assert!(config.codec().decode(&bytes, MessageType::RpcResponse).is_err());
        assert!(CodecConfig::default().codec().decode(&bytes, MessageType::RpcResponse).is_ok());
    }
}
