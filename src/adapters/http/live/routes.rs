//! Axum router configuration for live endpoints.

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::adapters::http::middleware::{auth_middleware, AuthState};

use super::handlers::{
    get_bulk_presence, get_live_metrics, get_presence, get_prometheus_metrics, LiveAppState,
};

/// Create the live API router, mounted at `/api/live`.
///
/// # Routes (require authentication)
/// - `GET /metrics` - JSON metrics snapshot
/// - `GET /presence/:user_id` - Online state of one user
/// - `POST /presence/bulk` - Online state of several users
pub fn live_routes(state: LiveAppState, auth: AuthState) -> Router {
    Router::new()
        .route("/metrics", get(get_live_metrics))
        .route("/presence/bulk", post(get_bulk_presence))
        .route("/presence/:user_id", get(get_presence))
        .layer(middleware::from_fn_with_state(auth, auth_middleware))
        .with_state(state)
}

/// Create the Prometheus scrape router (`GET /metrics`).
pub fn prometheus_routes(state: LiveAppState) -> Router {
    Router::new()
        .route("/metrics", get(get_prometheus_metrics))
        .with_state(state)
}

/// Create the complete live HTTP router.
///
/// ```ignore
/// let app = live_router(LiveAppState::new(service), verifier);
/// ```
pub fn live_router(state: LiveAppState, auth: AuthState) -> Router {
    Router::new()
        .nest("/api/live", live_routes(state.clone(), auth))
        .merge(prometheus_routes(state))
}
