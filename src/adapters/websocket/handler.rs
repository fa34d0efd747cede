//! WebSocket upgrade handler.
//!
//! Handles the HTTP → WebSocket upgrade and hands the socket to the
//! connection loops:
//! 1. Verify the bearer token (`?token=` or `Authorization: Bearer`)
//! 2. Resolve the client IP and optional `space_id`
//! 3. Upgrade to WebSocket
//! 4. Run the session until disconnect

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{future, SinkExt, StreamExt};
use serde::Deserialize;

use crate::adapters::http::middleware::{auth_error_response, bearer_token};
use crate::domain::foundation::{AuthError, SpaceId};
use crate::ports::TokenVerifier;

use super::connection::serve_connection;
use super::frame::{CloseReason, Frame};
use super::manager::ConnectionManager;
use super::session::SessionParams;

/// State required for WebSocket handling.
#[derive(Clone)]
pub struct WebSocketState {
    pub manager: ConnectionManager,
    pub verifier: Arc<dyn TokenVerifier>,
    /// Use the first `X-Forwarded-For` hop as the client IP.
    pub trust_forwarded_for: bool,
}

impl WebSocketState {
    pub fn new(manager: ConnectionManager, verifier: Arc<dyn TokenVerifier>) -> Self {
        Self {
            manager,
            verifier,
            trust_forwarded_for: false,
        }
    }

    pub fn trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }
}

/// Query parameters accepted on the upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub token: Option<String>,
    pub space_id: Option<String>,
}

/// Handle WebSocket upgrade requests.
///
/// Route: `GET /ws`
///
/// Authentication is checked before the upgrade headers, so a client
/// without a valid token always sees 401.
pub async fn ws_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(state): State<WebSocketState>,
    Query(params): Query<ConnectParams>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let token = params
        .token
        .filter(|token| !token.is_empty())
        .or_else(|| bearer_token(&headers).map(str::to_string));
    let Some(token) = token else {
        return auth_error_response(&AuthError::MissingToken);
    };

    let user_id = match state.verifier.verify(&token).await {
        Ok(user_id) => user_id,
        Err(e) => {
            tracing::warn!(peer = %peer, error = %e, "WebSocket authentication failed");
            return auth_error_response(&e);
        }
    };

    let space_id = match params.space_id.as_deref().filter(|raw| !raw.is_empty()) {
        None => None,
        Some(raw) => match raw.parse::<SpaceId>() {
            Ok(space_id) => Some(space_id),
            Err(_) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({
                        "error": "Invalid space_id",
                        "code": "VALIDATION_ERROR"
                    })),
                )
                    .into_response();
            }
        },
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let session = SessionParams {
        user_id,
        space_id,
        ip_address: client_ip(&headers, peer, state.trust_forwarded_for),
    };
    let manager = state.manager.clone();

    ws.max_message_size(manager.config().max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, manager, session))
}

async fn handle_socket(socket: WebSocket, manager: ConnectionManager, params: SessionParams) {
    let (sink, stream) = socket.split();
    let sink = sink.with(|frame: Frame| future::ready(Ok::<_, axum::Error>(Message::from(frame))));
    let stream = stream.map(|message| message.map(Frame::from));
    serve_connection(manager, params, sink, stream).await;
}

/// Client address: the socket peer, or the first forwarded hop when the
/// deployment sits behind a trusted proxy.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = headers
            .get("X-Forwarded-For")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|hop| !hop.is_empty());
        if let Some(hop) = forwarded {
            return hop.to_string();
        }
    }
    peer.ip().to_string()
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        match message {
            Message::Text(text) => Frame::Text(text),
            Message::Binary(bytes) => Frame::Binary(bytes),
            Message::Ping(bytes) => Frame::Ping(bytes),
            Message::Pong(bytes) => Frame::Pong(bytes),
            Message::Close(frame) => {
                Frame::Close(frame.map(|f| CloseReason::new(f.code, f.reason.into_owned())))
            }
        }
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(bytes) => Message::Binary(bytes),
            Frame::Ping(bytes) => Message::Ping(bytes),
            Frame::Pong(bytes) => Message::Pong(bytes),
            Frame::Close(reason) => Message::Close(reason.map(|r| CloseFrame {
                code: r.code,
                reason: Cow::Owned(r.reason),
            })),
        }
    }
}

/// Router exposing `GET /ws`.
pub fn websocket_router(state: WebSocketState) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::auth::MockTokenVerifier;
    use crate::adapters::websocket::ManagerConfig;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn peer() -> SocketAddr {
        "192.168.1.10:5000".parse().unwrap()
    }

    #[test]
    fn client_ip_ignores_forwarded_header_unless_trusted() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Forwarded-For", "203.0.113.7, 10.0.0.1".parse().unwrap());

        assert_eq!(client_ip(&headers, peer(), false), "192.168.1.10");
        assert_eq!(client_ip(&headers, peer(), true), "203.0.113.7");
    }

    #[test]
    fn client_ip_falls_back_to_peer_without_header() {
        assert_eq!(client_ip(&HeaderMap::new(), peer(), true), "192.168.1.10");
    }

    #[test]
    fn close_frames_convert_both_ways() {
        let message = Message::from(Frame::Close(Some(CloseReason::policy("limit"))));
        match &message {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, 1008);
                assert_eq!(frame.reason, "limit");
            }
            other => panic!("unexpected message {:?}", other),
        }
        assert_eq!(
            Frame::from(message),
            Frame::Close(Some(CloseReason::policy("limit")))
        );
    }

    async fn upgrade_status(uri: &str, authorization: Option<&str>) -> StatusCode {
        let manager = ConnectionManager::start(ManagerConfig::default(), None, None);
        let verifier = Arc::new(MockTokenVerifier::new().with_user("good-token", "alice"));
        let app = websocket_router(WebSocketState::new(manager.clone(), verifier));

        let mut request = Request::builder()
            .uri(uri)
            .header("connection", "upgrade")
            .header("upgrade", "websocket")
            .header("sec-websocket-version", "13")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==");
        if let Some(value) = authorization {
            request = request.header("authorization", value);
        }
        let mut request = request.body(Body::empty()).unwrap();
        request.extensions_mut().insert(ConnectInfo(peer()));

        let status = app.oneshot(request).await.unwrap().status();
        manager.shutdown().await;
        status
    }

    #[tokio::test]
    async fn upgrade_without_token_is_unauthorized() {
        assert_eq!(upgrade_status("/ws", None).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn upgrade_with_bad_token_is_unauthorized() {
        assert_eq!(
            upgrade_status("/ws?token=nope", None).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            upgrade_status("/ws", Some("Bearer nope")).await,
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn upgrade_with_bad_space_id_is_rejected() {
        assert_eq!(
            upgrade_status("/ws?token=good-token&space_id=not-a-uuid", None).await,
            StatusCode::BAD_REQUEST
        );
    }
}
