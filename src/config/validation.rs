//! Configuration validation.
//!
//! # Design Decisions
//! - Returns all validation errors, not just the first
//! - Pure function: `&RelayConfig → Result<(), Vec<ValidationError>>`
//! - Agent settings are checked separately, only when running an agent

use std::net::SocketAddr;

use crate::config::schema::RelayConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Semantic checks for the relay side.
pub fn validate_config(config: &RelayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }
    if !config.listener.connector_path.starts_with('/') || config.listener.connector_path.len() < 2 {
        errors.push(ValidationError::new("listener.connector_path", "must be an absolute path"));
    }
    if config.listener.max_body_bytes == 0 {
        errors.push(ValidationError::new("listener.max_body_bytes", "must be greater than 0"));
    }
    if config.listener.max_frame_bytes == 0 {
        errors.push(ValidationError::new("listener.max_frame_bytes", "must be greater than 0"));
    }
    if config.directory.root.trim().is_empty() {
        errors.push(ValidationError::new("directory.root", "must not be empty"));
    }
    if config.sessions.handshake_timeout_secs == 0 {
        errors.push(ValidationError::new("sessions.handshake_timeout_secs", "must be greater than 0"));
    }
    if config.sessions.liveness_timeout_secs == 0 {
        errors.push(ValidationError::new("sessions.liveness_timeout_secs", "must be greater than 0"));
    }
    if config.sessions.sweep_interval_secs == 0 {
        errors.push(ValidationError::new("sessions.sweep_interval_secs", "must be greater than 0"));
    }
    if config.rpc.request_timeout_secs == 0 {
        errors.push(ValidationError::new("rpc.request_timeout_secs", "must be greater than 0"));
    }
    if config.codec.max_payload_bytes == 0 {
        errors.push(ValidationError::new("codec.max_payload_bytes", "must be greater than 0"));
    }
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Semantic checks for `hub-relay agent`.
pub fn validate_agent_config(config: &RelayConfig) -> Result<(), Vec<ValidationError>> {
    let agent = &config.agent;
    let mut errors = Vec::new();

    match url::Url::parse(&agent.relay_url) {
        Ok(url) if matches!(url.scheme(), "ws" | "wss") => {}
        _ => errors.push(ValidationError::new("agent.relay_url", "must be a ws:// or wss:// URL")),
    }
    if agent.identity.trim().is_empty() {
        errors.push(ValidationError::new("agent.identity", "must not be empty"));
    }
    if agent.password.is_empty() {
        errors.push(ValidationError::new("agent.password", "must not be empty"));
    }
    if url::Url::parse(&agent.local_base_url).is_err() {
        errors.push(ValidationError::new("agent.local_base_url", "must be an absolute URL"));
    }
    if agent.ping_interval_secs == 0 {
        errors.push(ValidationError::new("agent.ping_interval_secs", "must be greater than 0"));
    }
    if agent.reconnect_base_ms == 0 || agent.reconnect_max_ms < agent.reconnect_base_ms {
        errors.push(ValidationError::new(
            "agent.reconnect_max_ms",
            "backoff needs 0 < reconnect_base_ms <= reconnect_max_ms",
        ));
    }
    if config.codec.max_payload_bytes == 0 {
        errors.push(ValidationError::new("codec.max_payload_bytes", "must be greater than 0"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_for_relay() {
        assert!(validate_config(&RelayConfig::default()).is_ok());
    }

    #[test]
    fn default_agent_config_needs_credentials() {
        let errors = validate_agent_config(&RelayConfig::default()).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(fields, vec!["agent.identity", "agent.password"]);
    }

    #[test]
    fn rejects_bad_addresses() {
        let mut config = RelayConfig::default();
        config.listener.bind_address = "nowhere".into();
        config.observability.metrics_enabled = true;
        config.observability.metrics_address = "also nowhere".into();
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn rejects_zero_payload_cap() {
        let mut config = RelayConfig::default();
        config.codec.max_payload_bytes = 0;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "codec.max_payload_bytes");
    }
}
