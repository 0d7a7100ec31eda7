//! Per-session channel statistics.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

const NEVER: i64 = i64::MIN;

/// Lock-free counters updated by the write path and the dispatcher.
#[derive(Debug)]
pub struct ChannelStatistics {
    connected_at: DateTime<Utc>,
    reset_at_ms: AtomicI64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    malformed_received: AtomicU64,
    send_errors: AtomicU64,
    receive_errors: AtomicU64,
    last_sent_ms: AtomicI64,
    last_received_ms: AtomicI64,
}

/// Point-in-time copy of [`ChannelStatistics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    pub connected_at: DateTime<Utc>,
    pub statistics_reset_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub malformed_messages_received: u64,
    pub send_errors: u64,
    pub receive_errors: u64,
    pub last_message_sent: Option<DateTime<Utc>>,
    pub last_message_received: Option<DateTime<Utc>>,
}

impl Default for ChannelStatistics {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl ChannelStatistics {
    /// `connected_at` is kept at millisecond precision, the same as every
    /// other timestamp here.
    pub fn new(connected_at: DateTime<Utc>) -> Self {
        let connected_at = DateTime::from_timestamp_millis(connected_at.timestamp_millis()).unwrap_or(connected_at);
        Self {
            connected_at,
            reset_at_ms: AtomicI64::new(connected_at.timestamp_millis()),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            malformed_received: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            receive_errors: AtomicU64::new(0),
            last_sent_ms: AtomicI64::new(NEVER),
            last_received_ms: AtomicI64::new(NEVER),
        }
    }

    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.last_sent_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.last_received_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_receive_error(&self) {
        self.receive_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Zero every counter. Connection time is kept.
    pub fn reset(&self) {
        for counter in [
            &self.bytes_sent,
            &self.bytes_received,
            &self.messages_sent,
            &self.messages_received,
            &self.malformed_received,
            &self.send_errors,
            &self.receive_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.last_sent_ms.store(NEVER, Ordering::Relaxed);
        self.last_received_ms.store(NEVER, Ordering::Relaxed);
        self.reset_at_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        let now = Utc::now();
        StatisticsSnapshot {
            connected_at: self.connected_at,
            statistics_reset_at: from_millis(self.reset_at_ms.load(Ordering::Relaxed)).unwrap_or(self.connected_at),
            uptime_secs: (now - self.connected_at).num_seconds(),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            malformed_messages_received: self.malformed_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
            last_message_sent: from_millis(self.last_sent_ms.load(Ordering::Relaxed)),
            last_message_received: from_millis(self.last_received_ms.load(Ordering::Relaxed)),
        }
    }
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    if ms == NEVER {
        return None;
    }
    DateTime::from_timestamp_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_traffic_and_resets() {
        let stats = ChannelStatistics::default();
        stats.record_sent(10);
        stats.record_sent(5);
        stats.record_received(7);
        stats.record_malformed();

        let snap = stats.snapshot();
        assert_eq!(snap.bytes_sent, 15);
        assert_eq!(snap.messages_sent, 2);
        assert_eq!(snap.bytes_received, 7);
        assert_eq!(snap.malformed_messages_received, 1);
        assert!(snap.last_message_sent.is_some());

        stats.reset();
        let snap = stats.snapshot();
        assert_eq!(snap.bytes_sent, 0);
        assert_eq!(snap.messages_received, 0);
        assert!(snap.last_message_received.is_none());
        assert!(snap.statistics_reset_at >= snap.connected_at);
    }

    #[test]
    fn reset_time_never_precedes_connect_time() {
        let connected_at = DateTime::from_timestamp(1_700_000_000, 999_999_999).unwrap();
        let stats = ChannelStatistics::new(connected_at);

        let snap = stats.snapshot();
        assert_eq!(snap.statistics_reset_at, snap.connected_at);
        assert_eq!(snap.connected_at.timestamp_subsec_nanos(), 999_000_000);

        stats.reset();
        assert!(stats.snapshot().statistics_reset_at >= snap.connected_at);
    }
}
