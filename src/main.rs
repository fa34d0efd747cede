//! connect-live server binary.
//!
//! Wires configuration, the event bus, the connection manager and the HTTP
//! routes together, then serves until Ctrl-C or SIGTERM.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use connect_live::adapters::auth::{JwtTokenVerifier, UserChannelGuard};
use connect_live::adapters::events::{MemoryBroker, RedisBroker};
use connect_live::adapters::http::{live_router, LiveAppState};
use connect_live::adapters::websocket::{websocket_router, ConnectionManager, WebSocketState};
use connect_live::application::LiveService;
use connect_live::config::AppConfig;
use connect_live::ports::{ChannelAuthorizer, EventBus, TokenVerifier};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let config = AppConfig::load()?;
    init_tracing(&config);
    config.validate()?;

    let bus = connect_bus(&config).await?;
    let verifier: Arc<dyn TokenVerifier> = Arc::new(
        JwtTokenVerifier::new(&config.auth.token_secret).with_leeway(config.auth.leeway_secs),
    );
    let authorizer: Arc<dyn ChannelAuthorizer> = Arc::new(UserChannelGuard::new());

    let mut service = LiveService::new(bus.clone());
    let mut manager = None;
    let mut app = Router::new();

    if config.live.enabled {
        let started = ConnectionManager::start(
            config.live.manager_config(),
            Some(bus.clone()),
            Some(authorizer),
        );
        let ws_state = WebSocketState::new(started.clone(), verifier.clone())
            .trust_forwarded_for(config.live.trust_forwarded_for);
        app = app.merge(websocket_router(ws_state));
        service = service.with_connection_manager(started.clone());
        manager = Some(started);
    } else {
        tracing::warn!("Live layer disabled; WebSocket endpoint not mounted");
    }

    let live_state = if config.live.enabled {
        LiveAppState::new(service)
    } else {
        LiveAppState::disabled()
    };
    let app = app
        .merge(live_router(live_state, verifier))
        .layer(TraceLayer::new_for_http());

    let addr = config.server.socket_addr()?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("HTTP server stopped");
    if let Some(manager) = manager {
        manager.shutdown().await;
    }
    if let Err(e) = bus.close().await {
        tracing::warn!(error = %e, "Event bus close failed");
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.server.log_level));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if config.is_production() {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

async fn connect_bus(config: &AppConfig) -> Result<Arc<dyn EventBus>, BoxError> {
    match config.redis_url() {
        Some(url) => {
            tracing::info!("Using Redis event broker for live features");
            let broker = RedisBroker::connect(config.redis.broker_config(url)).await?;
            Ok(Arc::new(broker))
        }
        None => {
            tracing::warn!(
                "Using in-memory event broker; not suitable for multi-instance deployments"
            );
            Ok(Arc::new(MemoryBroker::new()))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
