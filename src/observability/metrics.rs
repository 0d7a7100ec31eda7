//! Metrics collection and exposition.
//!
//! # Metrics
//! - `relay_forward_requests_total` (counter): forwarded requests by outcome, status
//! - `relay_forward_duration_seconds` (histogram): front door latency
//! - `relay_sessions_active` (gauge): live agent sessions
//! - `relay_sessions_terminated_total` (counter): sessions ended, by reason
//! - `relay_authorizations_total` (counter): handshakes by result
//! - `relay_pending_correlations` (gauge): in-flight correlated requests
//! - `relay_malformed_envelopes_total` (counter): dropped inbound envelopes
//! - `relay_unmatched_responses_total` (counter): late, duplicate or unknown responses
//! - `relay_raw_messages_total` (counter): inbound raw messages, by kind

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Start the Prometheus scrape endpoint on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_forward(outcome: &'static str, status: u16, start: Instant) {
    metrics::counter!(
        "relay_forward_requests_total",
        "outcome" => outcome,
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!("relay_forward_duration_seconds", "outcome" => outcome)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_authorization(result: &'static str) {
    metrics::counter!("relay_authorizations_total", "result" => result).increment(1);
}

pub fn record_session_opened() {
    metrics::gauge!("relay_sessions_active").increment(1.0);
}

pub fn record_session_closed(reason: &'static str) {
    metrics::gauge!("relay_sessions_active").decrement(1.0);
    metrics::counter!("relay_sessions_terminated_total", "reason" => reason).increment(1);
}

pub fn record_pending_delta(delta: f64) {
    metrics::gauge!("relay_pending_correlations").increment(delta);
}

pub fn record_malformed(tag: String) {
    metrics::counter!("relay_malformed_envelopes_total", "tag" => tag).increment(1);
}

pub fn record_unmatched_response() {
    metrics::counter!("relay_unmatched_responses_total").increment(1);
}

pub fn record_raw_message(kind: String) {
    metrics::counter!("relay_raw_messages_total", "kind" => kind).increment(1);
}
