//! Event bus adapters.
//!
//! Implementations of the `EventBus` port:
//!
//! - `MemoryBroker` - in-process fan-out for single-instance deployments and tests
//! - `RedisBroker` - Redis pub/sub with health monitoring and auto-reconnect
//!
//! Both drop events for subscribers whose queue is full rather than
//! blocking the publisher.

mod memory_broker;
mod metrics;
mod reconnect;
mod redis_broker;
mod redis_transport;

pub use memory_broker::{MemoryBroker, SUBSCRIBER_QUEUE_CAPACITY};
pub use metrics::BrokerMetrics;
pub use reconnect::{Backoff, ConnectionState, ReconnectMachine};
pub use redis_broker::{RedisBroker, RedisBrokerConfig};
pub use redis_transport::{
    PayloadStream, PubSubTransport, RedisTimeouts, RedisTransport, SubscriptionKind,
};
