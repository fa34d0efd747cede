//! HTTP adapters - REST API implementations.

pub mod live;
pub mod middleware;

// Re-export key types for convenience
pub use live::{live_router, LiveAppState};
