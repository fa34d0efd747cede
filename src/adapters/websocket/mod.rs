//! WebSocket adapters for real-time event delivery.
//!
//! This module pushes live events to connected clients over WebSocket
//! connections.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                         Event Bus                                    │
//! │   MemoryBroker (single instance) │ RedisBroker (multi instance)      │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                     │
//!                                     │ subscribe_pattern("*")
//!                                     ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                    ConnectionManager                                 │
//! │   - Registers sessions, enforces per-user / per-IP limits           │
//! │   - Indexes sessions by user and IP                                 │
//! │   - Fans events out to sessions subscribed to the event channel     │
//! │   - Evicts idle sessions                                            │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                     │
//!                                     │ try_enqueue (bounded, drop on full)
//!                                     ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                      ClientSession                                   │
//! │   read loop ── subscribe / unsubscribe / ping / typing / read       │
//! │   write loop ── batched text frames + keepalive pings               │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - [`messages`] - WebSocket message protocol types
//! - [`session`] - Per-connection state and inbound protocol handling
//! - [`connection`] - Read/write loops and their supervisor
//! - [`manager`] - Session registry, broadcast and bus bridge
//! - [`handler`] - Axum WebSocket upgrade handler

pub mod connection;
pub mod frame;
pub mod handler;
pub mod manager;
pub mod messages;
pub mod metrics;
pub mod session;

pub use connection::serve_connection;
pub use frame::{CloseReason, Frame};
pub use handler::{client_ip, websocket_router, ws_handler, ConnectParams, WebSocketState};
pub use manager::{
    AllowAllChannels, Broadcast, ConnectionManager, ManagerConfig, RegistrationError,
    CATCH_ALL_PATTERN,
};
pub use messages::{ClientAction, ClientMessage, ServerMessage, ServerMessageType};
pub use metrics::{ConnectionMetrics, ConnectionMetricsSnapshot};
pub use session::{ClientSession, EnqueueOutcome, Outbound, SessionParams};
