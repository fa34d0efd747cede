//! Broker counters.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::domain::foundation::Timestamp;
use crate::ports::BrokerMetricsSnapshot;

/// Monotonic counters written by the broker's own tasks and read by anyone.
#[derive(Debug, Default)]
pub struct BrokerMetrics {
    events_published: AtomicU64,
    events_received: AtomicU64,
    publish_errors: AtomicU64,
    reconnect_count: AtomicU64,
    last_reconnect_time: Mutex<Option<Timestamp>>,
}

impl BrokerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_error(&self) {
        self.publish_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Bumps the reconnect counter and stamps the time. Returns the new count.
    pub fn record_reconnect(&self) -> u64 {
        *self.last_reconnect_time.lock() = Some(Timestamp::now());
        self.reconnect_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn events_published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }

    pub fn events_received(&self) -> u64 {
        self.events_received.load(Ordering::Relaxed)
    }

    pub fn publish_errors(&self) -> u64 {
        self.publish_errors.load(Ordering::Relaxed)
    }

    pub fn reconnect_count(&self) -> u64 {
        self.reconnect_count.load(Ordering::Relaxed)
    }

    pub fn last_reconnect_time(&self) -> Option<Timestamp> {
        *self.last_reconnect_time.lock()
    }

    pub fn snapshot(&self) -> BrokerMetricsSnapshot {
        BrokerMetricsSnapshot {
            events_published: self.events_published(),
            events_received: self.events_received(),
            publish_errors: self.publish_errors(),
            reconnect_count: self.reconnect_count(),
            last_reconnect_time: self.last_reconnect_time(),
        }
    }
}
