//! Adapters - Implementations of port interfaces.
//!
//! Adapters connect the live layer to external systems:
//! - `events` - Event bus implementations (in-memory, Redis)
//! - `websocket` - Client connections, fan-out and the upgrade handler
//! - `http` - Metrics and presence endpoints, auth middleware
//! - `auth` - Token verification and channel authorization

pub mod auth;
pub mod events;
pub mod http;
pub mod websocket;

pub use events::{MemoryBroker, RedisBroker, RedisBrokerConfig};
pub use websocket::{ConnectionManager, ManagerConfig};
