//! HTTP surface and chat channel.
//!
//! A deliberately small control API — session allocation and health — plus
//! the WebSocket endpoint that carries the chat channel. The socket is
//! adapted onto the connection manager through an in-memory envelope channel,
//! so everything below the transport layer is testable without a socket.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use utoipa::{OpenApi, ToSchema};

use appbuilder_protocol::ClientMessage;

use crate::connection::ConnectionManager;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ConnectionManager>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/session", post(create_session))
        .route("/sessions", get(list_sessions))
        .route("/health", get(get_health))
        .route("/ws/chat/:session_id", get(chat_ws))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[derive(OpenApi)]
#[openapi(
    paths(create_session, list_sessions, get_health),
    components(schemas(SessionResponse, SessionListResponse, HealthResponse))
)]
pub struct ApiDoc;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SessionResponse {
    pub session_id: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SessionListResponse {
    pub sessions: Vec<String>,
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}

/// Allocates a session identifier. State is created lazily on the first
/// channel bind, so this never fails.
#[utoipa::path(post, path = "/session", responses((status = 200, body = SessionResponse)))]
async fn create_session() -> Json<SessionResponse> {
    let session_id = uuid::Uuid::new_v4().to_string();
    info!(session_id = %session_id, "allocated session id");
    Json(SessionResponse { session_id })
}

#[utoipa::path(get, path = "/sessions", responses((status = 200, body = SessionListResponse)))]
async fn list_sessions(State(state): State<AppState>) -> Json<SessionListResponse> {
    let sessions = state.manager.session_ids().await;
    let count = sessions.len();
    Json(SessionListResponse { sessions, count })
}

#[utoipa::path(get, path = "/health", responses((status = 200, body = HealthResponse)))]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct ChatQuery {
    #[serde(default)]
    reconnect: bool,
}

async fn chat_ws(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    Query(query): Query<ChatQuery>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_chat_socket(socket, session_id, query.reconnect, state))
}

async fn handle_chat_socket(
    mut socket: WebSocket,
    session_id: String,
    reconnect: bool,
    state: AppState,
) {
    let (channel_tx, mut channel_rx) = mpsc::unbounded_channel();

    // Initialization must finish before the first envelope reaches the
    // client; on failure the socket closes without ever sending one.
    if let Err(err) = state.manager.connect(channel_tx, &session_id, reconnect).await {
        warn!(session_id = %session_id, error = %err, "connect failed; closing socket");
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    let (mut ws_tx, mut ws_rx) = socket.split();

    let pump = tokio::spawn(async move {
        while let Some(envelope) = channel_rx.recv().await {
            let Ok(payload) = serde_json::to_string(&envelope) else {
                continue;
            };
            if ws_tx.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(client_message) => {
                    if state
                        .manager
                        .receive(&session_id, client_message)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(err) => {
                    warn!(session_id = %session_id, error = %err, "invalid client message");
                    state
                        .manager
                        .send_error(&session_id, "invalid message format")
                        .await;
                }
            },
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    pump.abort();
    state.manager.disconnect(&session_id, true).await;
    info!(session_id = %session_id, "chat socket closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::mock::ScriptedFactory;
    use crate::config::{RuntimeConfig, SandboxMode};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let dir = std::env::temp_dir().join("appbuilder-router-test");
        let mut config = RuntimeConfig::new(dir);
        config.sandbox_mode = SandboxMode::Mock;
        AppState {
            manager: Arc::new(ConnectionManager::new(
                config,
                Arc::new(ScriptedFactory::default()),
            )),
        }
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.status, "ok");
    }

    #[tokio::test]
    async fn session_allocation_returns_uuid() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::post("/session").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: SessionResponse = serde_json::from_slice(&body).unwrap();
        assert!(uuid::Uuid::parse_str(&parsed.session_id).is_ok());
    }

    #[tokio::test]
    async fn sessions_lists_active_sessions() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::get("/sessions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: SessionListResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.count, 0);
    }
}
