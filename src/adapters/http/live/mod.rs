//! HTTP adapter for the live layer.
//!
//! Exposes connection state and metrics via REST:
//! - `GET /api/live/metrics` - JSON metrics snapshot
//! - `GET /api/live/presence/:user_id` - Online state of one user
//! - `POST /api/live/presence/bulk` - Online state of several users
//! - `GET /metrics` - Prometheus text exposition

pub mod dto;
pub mod handlers;
pub mod prometheus;
pub mod routes;

pub use dto::*;
pub use handlers::LiveAppState;
pub use prometheus::PrometheusExporter;
pub use routes::{live_router, live_routes, prometheus_routes};
