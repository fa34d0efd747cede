//! Application layer.
//!
//! Business services never talk to the event bus directly; they go through
//! [`LiveService`], which knows the well-known event types and channels.

pub mod live_service;

pub use live_service::{LiveService, LiveServiceError};
