//! connect-live - real-time event fan-out over WebSockets.
//!
//! Server-side services publish domain events (a message was sent, a post
//! was liked) through [`application::LiveService`]. An event bus carries
//! them, in-process or across instances via Redis, to the
//! [`adapters::websocket::ConnectionManager`], which pushes each event to
//! every connected client subscribed to its channel.

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;
