// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Relay server core: shared state, HTTP/WebSocket surface, and the
//! connection handler that dispatches accepted sockets to role handlers.

use crate::config::ServerConfig;
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub mod endpoint;
pub mod protocol;
pub mod registry;
pub mod roles;
pub mod session;
pub mod sweeper;
pub mod throttle;

use endpoint::EndpointHandle;
use protocol::StatusFrame;
pub use registry::{CapacityExceeded, SessionRegistry};
pub use session::TransferSession;
pub use throttle::ConnectionThrottle;

/// Shared application state, dependency-injected into every handler.
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<RwLock<SessionRegistry>>,
    pub throttle: ConnectionThrottle,
    pub shutdown: Arc<Notify>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        let registry = SessionRegistry::new(config.max_sessions);
        let throttle = ConnectionThrottle::new(config.max_connections_per_user);
        Self {
            config: Arc::new(config),
            registry: Arc::new(RwLock::new(registry)),
            throttle,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Drop a session from the registry. Idempotent.
    pub async fn remove_session(&self, session_id: &str) {
        self.registry.write().await.remove(session_id);
    }

    pub async fn session_count(&self) -> usize {
        self.registry.read().await.len()
    }
}

/// Build the HTTP/WebSocket router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/sessions", get(sessions))
        .route("/ws/:session_id/:role/:user_id", get(ws_upgrade))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the shutdown notify fires.
pub async fn run(state: Arc<AppState>) -> Result<(), ServerError> {
    let addr = format!("{}:{}", state.config.bind_address, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ServerError::Bind(e.to_string()))?;

    info!("Relay listening on {}", addr);

    let shutdown = state.shutdown.clone();
    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.notified().await })
        .await
        .map_err(|e| ServerError::Io(e.to_string()))
}

/// WebSocket upgrade endpoint. All three path parameters are opaque
/// strings; admission checks happen after the upgrade so rejections reach
/// the client as error frames, not HTTP statuses.
async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Path((session_id, role, user_id)): Path<(String, String, String)>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id, role, user_id))
}

/// Per-connection entry point: admission, role dispatch, cleanup.
///
/// Every successful throttle acquire is matched by exactly one release on
/// every exit path.
async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    session_id: String,
    role: String,
    user_id: String,
) {
    let conn_id = Uuid::new_v4().to_string()[..8].to_string();
    info!(
        conn_id = %conn_id,
        user_id = %user_id,
        role = %role,
        session_id = %session_id,
        "Connection accepted"
    );

    let (sink, mut inbound) = socket.split();
    let handle = EndpointHandle::spawn_writer(sink);

    if !state.throttle.try_acquire(&user_id) {
        warn!(conn_id = %conn_id, user_id = %user_id, "Rejected: too many connections");
        let _ = handle
            .send_json(&StatusFrame::error("Too many connections"))
            .await;
        handle.close();
        return;
    }

    // Capacity check and insert are one composite under the write lock;
    // the guard is released before any socket I/O.
    let created = {
        let mut registry = state.registry.write().await;
        registry.get_or_create(&session_id)
    };
    let session = match created {
        Ok(session) => session,
        Err(CapacityExceeded) => {
            warn!(conn_id = %conn_id, session_id = %session_id, "Rejected: server at capacity");
            let _ = handle
                .send_json(&StatusFrame::error("Server at capacity"))
                .await;
            state.throttle.release(&user_id);
            handle.close();
            return;
        }
    };
    session.touch().await;

    let result = match role.as_str() {
        "sender" => {
            roles::run_sender(&state, &session, &handle, &mut inbound, &session_id, &user_id)
                .await
        }
        "receiver" => {
            roles::run_receiver(&state, &session, &handle, &mut inbound, &user_id).await
        }
        "peer" => {
            roles::run_peer(
                &state,
                &session,
                &handle,
                &mut inbound,
                &session_id,
                &user_id,
                &conn_id,
            )
            .await
        }
        other => {
            warn!(conn_id = %conn_id, role = %other, "Rejected: invalid mode");
            let _ = handle
                .send_json(&StatusFrame::error(format!("Invalid mode: {}", other)))
                .await;
            Ok(())
        }
    };

    if let Err(e) = result {
        error!(conn_id = %conn_id, session_id = %session_id, "Handler failed: {}", e);
        let _ = handle.send_json(&StatusFrame::error(e.to_string())).await;
    }

    state.throttle.release(&user_id);
    handle.close();
    debug!(conn_id = %conn_id, "Connection closed");
}

/// GET /api/health
async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "sessions": state.session_count().await,
        "timestamp": protocol::now_timestamp(),
    }))
}

/// Aggregate view of one live session.
#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub active: bool,
    pub bytes_transferred: u64,
    pub speed: f64,
    pub created_at: DateTime<Utc>,
}

/// GET /api/sessions
async fn sessions(State(state): State<Arc<AppState>>) -> Json<Vec<SessionSummary>> {
    let snapshot = state.registry.read().await.snapshot();
    let mut summaries = Vec::with_capacity(snapshot.len());
    for session in snapshot {
        let st = session.lock().await;
        summaries.push(SessionSummary {
            session_id: session.session_id.clone(),
            active: st.is_active,
            bytes_transferred: st.bytes_transferred,
            speed: st.calculate_speed(),
            created_at: session.created_at,
        });
    }
    Json(summaries)
}

/// Server error types.
#[derive(Debug)]
pub enum ServerError {
    Config(String),
    Bind(String),
    Io(String),
    Internal(String),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(s) => write!(f, "Configuration error: {}", s),
            Self::Bind(s) => write!(f, "Bind error: {}", s),
            Self::Io(s) => write!(f, "I/O error: {}", s),
            Self::Internal(s) => write!(f, "Internal error: {}", s),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn state_wires_config_caps() {
        let state = AppState::new(ServerConfig {
            max_sessions: 1,
            max_connections_per_user: 2,
            ..Default::default()
        });

        assert!(state.throttle.try_acquire("u"));
        assert!(state.throttle.try_acquire("u"));
        assert!(!state.throttle.try_acquire("u"));

        state.registry.write().await.get_or_create("a").unwrap();
        assert!(state.registry.write().await.get_or_create("b").is_err());
    }

    #[tokio::test]
    async fn remove_session_is_idempotent() {
        let state = AppState::new(ServerConfig::default());
        state.registry.write().await.get_or_create("a").unwrap();

        state.remove_session("a").await;
        state.remove_session("a").await;
        assert_eq!(state.session_count().await, 0);
    }

    #[test]
    fn server_error_display() {
        assert!(ServerError::Bind("x".into()).to_string().contains("Bind"));
        assert!(ServerError::Internal("y".into())
            .to_string()
            .contains("Internal"));
    }
}
