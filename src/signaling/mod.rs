#![forbid(unsafe_code)]

// Signaling module - WebSocket signaling server and its HTTP surface

pub mod connection;
pub mod directory;
pub mod gateway;
pub mod outbox;
pub mod protocol;

pub use directory::{Binding, ConnectionDirectory};
pub use gateway::SignalingGateway;

use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    gateway: Arc<SignalingGateway>,
    connection_semaphore: Arc<Semaphore>,
    metrics_token: Option<Arc<str>>,
}

impl SignalingServer {
    pub fn new(gateway: Arc<SignalingGateway>, max_connections: usize, metrics_token: Option<String>) -> Self {
        info!("Max connections: {}", max_connections);
        if metrics_token.is_none() {
            info!("METRICS_TOKEN not set, /metrics is unauthenticated");
        }
        Self {
            gateway,
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
            metrics_token: metrics_token.map(Arc::from),
        }
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/sessions/{session_id}/control-state", get(control_state_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Starts the signaling server on the specified port
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("Starting signaling server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let app = self.router();

        axum::serve(listener, app).await?;

        Ok(())
    }
}

/// Health check handler
async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    let registry = server.gateway.registry();
    Json(serde_json::json!({
        "status": "ok",
        "sessions": registry.session_count(),
        "participants": registry.participant_count(),
    }))
}

/// Metrics handler in Prometheus text exposition format, behind an optional bearer token
async fn metrics_handler(State(server): State<SignalingServer>, headers: HeaderMap) -> Response {
    if let Some(expected) = server.metrics_token.as_deref() {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != format!("Bearer {expected}") {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let registry = server.gateway.registry();
    let body = server
        .gateway
        .metrics()
        .render_prometheus(registry.session_count(), registry.participant_count());
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// Polling form of `getSessionControlState`
async fn control_state_handler(
    State(server): State<SignalingServer>,
    Path(session_id): Path<String>,
) -> Response {
    if let Err(e) = protocol::validate_session_id(&session_id) {
        return (StatusCode::BAD_REQUEST, Json(protocol::ServerMessage::error(&e))).into_response();
    }
    Json(server.gateway.session_state(&session_id).await).into_response()
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(server): State<SignalingServer>) -> Response {
    // Acquire connection permit (non-blocking)
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    ws.max_message_size(65_536)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| connection::handle_connection(socket, server.gateway, permit))
}
