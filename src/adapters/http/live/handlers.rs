//! HTTP handlers for the live endpoints.

use std::collections::BTreeMap;

use axum::extract::{rejection::JsonRejection, Json, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::adapters::http::middleware::RequireAuth;
use crate::adapters::websocket::ConnectionManager;
use crate::application::LiveService;
use crate::domain::foundation::UserId;

use super::dto::{
    BulkPresenceRequest, BulkPresenceResponse, ErrorResponse, LiveMetricsResponse,
    PresenceResponse,
};
use super::prometheus::{self, PrometheusExporter};

// ════════════════════════════════════════════════════════════════════════════════
// Application State
// ════════════════════════════════════════════════════════════════════════════════

/// Shared state for the live routes.
///
/// `service` is `None` when the live layer is disabled; every endpoint then
/// answers 503.
#[derive(Clone, Default)]
pub struct LiveAppState {
    pub service: Option<LiveService>,
    pub exporter: PrometheusExporter,
}

impl LiveAppState {
    pub fn new(service: LiveService) -> Self {
        Self {
            service: Some(service),
            exporter: PrometheusExporter::new(),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    fn manager(&self) -> Option<&ConnectionManager> {
        self.service.as_ref()?.connection_manager()
    }
}

fn unavailable() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, Json(ErrorResponse::unavailable())).into_response()
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse::invalid_request(message)),
    )
        .into_response()
}

// ════════════════════════════════════════════════════════════════════════════════
// Handlers
// ════════════════════════════════════════════════════════════════════════════════

/// GET /api/live/metrics
pub async fn get_live_metrics(
    State(state): State<LiveAppState>,
    RequireAuth(_user_id): RequireAuth,
) -> Response {
    let Some(service) = &state.service else {
        return unavailable();
    };

    Json(LiveMetricsResponse {
        websocket: service.websocket_metrics(),
        redis: service.broker_metrics(),
    })
    .into_response()
}

/// GET /api/live/presence/:user_id
pub async fn get_presence(
    State(state): State<LiveAppState>,
    RequireAuth(_caller): RequireAuth,
    Path(user_id): Path<String>,
) -> Response {
    let Some(manager) = state.manager() else {
        return unavailable();
    };
    let Ok(user_id) = UserId::new(user_id) else {
        return bad_request("User ID required");
    };

    let connection_count = manager.user_connections(&user_id);
    Json(PresenceResponse {
        user_id: user_id.to_string(),
        online: connection_count > 0,
        connection_count,
    })
    .into_response()
}

/// POST /api/live/presence/bulk
pub async fn get_bulk_presence(
    State(state): State<LiveAppState>,
    RequireAuth(_caller): RequireAuth,
    request: Result<Json<BulkPresenceRequest>, JsonRejection>,
) -> Response {
    let Some(manager) = state.manager() else {
        return unavailable();
    };
    let Json(request) = match request {
        Ok(request) => request,
        Err(rejection) => return bad_request(rejection.body_text()),
    };

    let presence: BTreeMap<String, bool> = request
        .user_ids
        .into_iter()
        .filter_map(|raw| UserId::new(raw).ok())
        .map(|user_id| {
            let online = manager.is_user_online(&user_id);
            (user_id.to_string(), online)
        })
        .collect();

    Json(BulkPresenceResponse { presence }).into_response()
}

/// GET /metrics
///
/// Prometheus text format; unauthenticated so scrapers can reach it.
pub async fn get_prometheus_metrics(State(state): State<LiveAppState>) -> Response {
    let Some(service) = &state.service else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "# Live service not available\n",
        )
            .into_response();
    };

    let body = state
        .exporter
        .render(&service.websocket_metrics(), service.broker_metrics().as_ref());
    ([(header::CONTENT_TYPE, prometheus::CONTENT_TYPE)], body).into_response()
}
