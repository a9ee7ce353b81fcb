//! API Router and Application State
//!
//! Central routing configuration and shared state.

use axum::{extract::State, http::HeaderValue, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::{
    config::Config,
    presence::PresenceRegistry,
    voice::{CallBroker, MediaEngine, SfuServer},
    ws::{self, ConnectionHub},
};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration
    pub config: Arc<Config>,
    /// Outbound channels of every open socket
    pub hub: Arc<ConnectionHub>,
    /// Identity -> connection map
    pub presence: Arc<PresenceRegistry>,
    /// Two-party call signaling
    pub broker: Arc<CallBroker>,
    /// SFU server for media rooms
    pub sfu: Arc<SfuServer>,
}

impl AppState {
    /// Create new application state.
    #[must_use]
    pub fn new(config: Config, engine: Arc<dyn MediaEngine>) -> Self {
        let hub = Arc::new(ConnectionHub::new());
        let presence = Arc::new(PresenceRegistry::new());
        let broker = Arc::new(CallBroker::new(
            presence.clone(),
            hub.clone(),
            config.call_timeout(),
        ));
        let sfu = Arc::new(SfuServer::from_config(engine, &config));

        Self {
            config: Arc::new(config),
            hub,
            presence,
            broker,
            sfu,
        }
    }

    /// Drain call timers and media resources.
    pub async fn shutdown(&self) {
        self.broker.shutdown().await;
        self.sfu.shutdown().await;
        info!("Application state drained");
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub connections: usize,
    pub online_users: usize,
    pub rooms: usize,
}

/// Online identities.
#[derive(Debug, Serialize)]
pub struct PresenceResponse {
    pub users: Vec<String>,
}

/// Create the main application router.
pub fn create_router(state: AppState) -> Router {
    let cors = match state.config.cors_origin.as_deref().map(HeaderValue::from_str) {
        Some(Ok(origin)) => CorsLayer::new()
            .allow_origin(origin)
            .allow_methods(Any)
            .allow_headers(Any),
        Some(Err(e)) => {
            warn!(error = %e, "Invalid CORS_ORIGIN, allowing any origin");
            CorsLayer::permissive()
        }
        None => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/presence", get(online_users))
        .route("/ws", get(ws::handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connections: state.hub.len(),
        online_users: state.presence.len().await,
        rooms: state.sfu.room_count().await,
    })
}

/// Sorted list of online identities.
async fn online_users(State(state): State<AppState>) -> Json<PresenceResponse> {
    Json(PresenceResponse {
        users: state.presence.online().await,
    })
}
