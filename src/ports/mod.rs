//! Ports - Interfaces for external dependencies.
//!
//! Following hexagonal architecture, ports define the contracts between
//! the live layer and the outside world. Adapters implement these ports.
//!
//! - `EventBus` - publish/subscribe transport for live events
//! - `TokenVerifier` - bearer token → user id, owned by the auth subsystem
//! - `ChannelAuthorizer` - "may this user subscribe to this channel"

mod channel_authorizer;
mod event_bus;
mod token_verifier;

pub use channel_authorizer::ChannelAuthorizer;
pub use event_bus::{BrokerMetricsSnapshot, BusError, EventBus, EventStream};
pub use token_verifier::TokenVerifier;
