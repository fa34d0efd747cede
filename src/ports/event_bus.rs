//! EventBus port - publish/subscribe contract for live events.
//!
//! The bus is best-effort and at-most-once: a subscriber that falls behind
//! loses events rather than slowing the publisher down. Two adapters exist,
//! an in-process broker and a Redis pub/sub broker; callers depend only on
//! this trait.
//!
//! ```text
//!  publisher ──publish──► EventBus ──► EventStream (subscriber A, bounded)
//!                                 └──► EventStream (subscriber B, bounded)
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::domain::foundation::Timestamp;
use crate::domain::live::Event;

/// Receiving half of a subscription.
///
/// The stream ends (`recv()` returns `None`) when the subscription is
/// removed, the bus is closed, or the backing connection drops.
pub type EventStream = mpsc::Receiver<Arc<Event>>;

/// Errors reported by event bus implementations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("event bus is closed")]
    Closed,

    #[error("already subscribed to channel: {0}")]
    AlreadySubscribed(String),

    #[error("not subscribed to channel: {0}")]
    NotSubscribed(String),

    #[error("invalid channel pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("failed to publish after {attempts} attempts: {reason}")]
    PublishFailed { attempts: u32, reason: String },

    #[error("failed to encode event: {0}")]
    Serialization(String),

    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker operation timed out")]
    Timeout,
}

impl BusError {
    /// Creates a connection error with a message.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// True for failures that a reconnect may cure.
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Connection(_) | BusError::Timeout)
    }
}

/// Point-in-time copy of a network broker's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BrokerMetricsSnapshot {
    pub events_published: u64,
    pub events_received: u64,
    pub publish_errors: u64,
    pub reconnect_count: u64,
    pub last_reconnect_time: Option<Timestamp>,
}

/// Port for the live event bus.
///
/// Implementations must ensure:
/// - `publish` never blocks on a slow subscriber; full subscriber queues drop
/// - `publish` with zero subscribers succeeds
/// - `subscribe` on an already-subscribed channel fails with `AlreadySubscribed`
/// - every operation fails with `Closed` after `close`, except `close` itself
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Delivers the event to all current subscribers of its channel.
    async fn publish(&self, event: Event) -> Result<(), BusError>;

    /// Subscribes to one exact channel.
    async fn subscribe(&self, channel: &str) -> Result<EventStream, BusError>;

    /// Subscribes to every channel matching a glob pattern (`*`, `?`, `[..]`).
    async fn subscribe_pattern(&self, pattern: &str) -> Result<EventStream, BusError>;

    /// Ends the subscription for `channel` (or pattern) and closes its stream.
    async fn unsubscribe(&self, channel: &str) -> Result<(), BusError>;

    /// Closes every subscription and releases resources. Idempotent.
    async fn close(&self) -> Result<(), BusError>;

    /// Fails if the bus is closed or its backing service is unreachable.
    async fn health_check(&self) -> Result<(), BusError>;

    /// Counters for network-backed brokers.
    fn metrics(&self) -> Option<BrokerMetricsSnapshot> {
        None
    }

    /// Generation counter bumped after every successful reconnect.
    ///
    /// Subscribers whose stream ended can wait on this to know when it is
    /// worth subscribing again. In-process brokers never reconnect and
    /// return `None`.
    fn reconnect_notifications(&self) -> Option<watch::Receiver<u64>> {
        None
    }
}
