//! Connection manager counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::domain::foundation::Timestamp;

/// Counters shared by the manager and every session it owns.
#[derive(Debug)]
pub struct ConnectionMetrics {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    connections_rejected: AtomicU64,
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    errors: AtomicU64,
    total_latency_ms: AtomicU64,
    latency_count: AtomicU64,
    last_error: Mutex<Option<(String, Timestamp)>>,
    started_at: Instant,
}

/// Point-in-time copy of [`ConnectionMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionMetricsSnapshot {
    pub active_connections: u64,
    pub total_connections: u64,
    pub connections_rejected: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub errors: u64,
    pub last_error: Option<String>,
    pub last_error_time: Option<Timestamp>,
    pub average_latency_ms: f64,
    pub message_throughput_sec: f64,
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionMetrics {
    pub fn new() -> Self {
        Self {
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            total_latency_ms: AtomicU64::new(0),
            latency_count: AtomicU64::new(0),
            last_error: Mutex::new(None),
            started_at: Instant::now(),
        }
    }

    pub fn record_connected(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disconnected(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
    }

    pub fn record_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self, count: u64) {
        self.messages_sent.fetch_add(count, Ordering::Relaxed);
    }

    /// A message discarded because the session's outbound queue was full.
    pub fn record_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, message: impl Into<String>) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some((message.into(), Timestamp::now()));
    }

    pub fn record_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.total_latency_ms.fetch_add(ms, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped.load(Ordering::Relaxed)
    }

    pub fn average_latency_ms(&self) -> f64 {
        let count = self.latency_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.total_latency_ms.load(Ordering::Relaxed) as f64 / count as f64
    }

    /// Messages received plus sent, per second since the manager started.
    pub fn message_throughput(&self) -> f64 {
        let secs = self.started_at.elapsed().as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        let total = self.messages_received.load(Ordering::Relaxed)
            + self.messages_sent.load(Ordering::Relaxed);
        total as f64 / secs
    }

    pub fn snapshot(&self) -> ConnectionMetricsSnapshot {
        let last_error = self.last_error.lock().clone();
        ConnectionMetricsSnapshot {
            active_connections: self.active_connections(),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped(),
            errors: self.errors.load(Ordering::Relaxed),
            last_error_time: last_error.as_ref().map(|(_, at)| *at),
            last_error: last_error.map(|(message, _)| message),
            average_latency_ms: self.average_latency_ms(),
            message_throughput_sec: self.message_throughput(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_connections_never_underflow() {
        let metrics = ConnectionMetrics::new();
        metrics.record_disconnected();
        assert_eq!(metrics.active_connections(), 0);

        metrics.record_connected();
        metrics.record_disconnected();
        metrics.record_disconnected();
        assert_eq!(metrics.active_connections(), 0);
        assert_eq!(metrics.snapshot().total_connections, 1);
    }

    #[test]
    fn dropped_messages_count_as_errors() {
        let metrics = ConnectionMetrics::new();
        metrics.record_dropped();
        metrics.record_dropped();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_dropped, 2);
        assert_eq!(snapshot.errors, 2);
        assert_eq!(snapshot.last_error, None);
    }

    #[test]
    fn record_error_keeps_latest_message() {
        let metrics = ConnectionMetrics::new();
        metrics.record_error("first");
        metrics.record_error("second");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.errors, 2);
        assert_eq!(snapshot.last_error.as_deref(), Some("second"));
        assert!(snapshot.last_error_time.is_some());
    }

    #[test]
    fn average_latency_is_zero_without_samples() {
        let metrics = ConnectionMetrics::new();
        assert_eq!(metrics.average_latency_ms(), 0.0);

        metrics.record_latency(Duration::from_millis(10));
        metrics.record_latency(Duration::from_millis(30));
        assert_eq!(metrics.average_latency_ms(), 20.0);
    }

    #[test]
    fn snapshot_uses_wire_names() {
        let metrics = ConnectionMetrics::new();
        metrics.record_connected();
        let value = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(value["active_connections"], 1);
        assert!(value.get("message_throughput_sec").is_some());
        assert!(value["last_error"].is_null());
    }
}
