use std::sync::Arc;

use axum::{
    extract::{Path, State, WebSocketUpgrade},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::envelope::now_millis;
use crate::error::RelayError;
use crate::relay::{self, RelayContext};
use crate::session::SessionId;

pub const WS_PATH: &str = "/sahayak-teacher";

pub struct AppState {
    pub relay: RelayContext,
    pub metrics: Option<PrometheusHandle>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/sahayak/health", get(health_handler))
        .route("/api/sahayak/teacher/session", post(create_teacher_session))
        .route(
            "/api/sahayak/teacher/session/custom",
            post(create_custom_teacher_session),
        )
        .route(
            "/api/sahayak/teacher/prompt-creator",
            post(create_prompt_creator_session),
        )
        .route("/api/sahayak/teacher/sessions", get(all_sessions_handler))
        .route(
            "/api/sahayak/teacher/session/:id/status",
            get(session_status_handler),
        )
        .route(
            "/api/sahayak/teacher/session/:id",
            delete(close_session_handler),
        )
        .route("/api/sahayak/teacher/session/:id/text", post(send_text_handler))
        .route("/metrics", get(metrics_handler))
        .route(WS_PATH, get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        let status = match &err {
            RelayError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            RelayError::SessionDegraded { .. } => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            RelayError::HandshakeTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RelayError::Transport(_) => StatusCode::BAD_GATEWAY,
            RelayError::Decode(_) | RelayError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "timestamp": now_millis(),
        }));
        (self.status, body).into_response()
    }
}

fn parse_session(raw: &str) -> Result<SessionId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::new(StatusCode::NOT_FOUND, format!("session {raw} not found")))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionCreated {
    session_id: SessionId,
    status: &'static str,
    message: &'static str,
    timestamp: i64,
}

impl SessionCreated {
    fn new(session_id: SessionId, message: &'static str) -> Json<Self> {
        Json(Self {
            session_id,
            status: "created",
            message,
            timestamp: now_millis(),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CustomPromptRequest {
    #[serde(default)]
    custom_prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TextRequest {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionStatus {
    session_id: SessionId,
    active: bool,
    status: String,
    screen_sharing: bool,
    timestamp: i64,
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "UP",
        "service": "sahayak-relay",
        "timestamp": now_millis(),
    }))
}

async fn create_teacher_session(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let id = state.relay.orchestrator.create_session(None).await?;
    Ok(SessionCreated::new(id, "Teacher session created"))
}

async fn create_custom_teacher_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CustomPromptRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let id = state
        .relay
        .orchestrator
        .create_session(request.custom_prompt.as_deref())
        .await?;
    Ok(SessionCreated::new(id, "Teacher session created with custom prompt"))
}

async fn create_prompt_creator_session(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let id = state
        .relay
        .orchestrator
        .create_prompt_creator_session()
        .await?;
    Ok(SessionCreated::new(id, "Prompt creator session created"))
}

async fn session_status_handler(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_session(&raw)?;
    let session = state
        .relay
        .orchestrator
        .session(&id)
        .ok_or(RelayError::SessionNotFound(id))?;
    Ok(Json(SessionStatus {
        session_id: id,
        active: session.is_active(),
        status: session.status_string(),
        screen_sharing: session.screen_sharing(),
        timestamp: now_millis(),
    }))
}

async fn close_session_handler(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_session(&raw)?;
    let closed = state.relay.orchestrator.close_session(&id);
    Ok(Json(json!({
        "sessionId": id,
        "closed": closed,
        "timestamp": now_millis(),
    })))
}

async fn all_sessions_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let sessions = state.relay.orchestrator.get_all_sessions_status();
    Json(json!({
        "totalSessions": sessions.len(),
        "sessions": sessions,
        "timestamp": now_millis(),
    }))
}

async fn send_text_handler(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
    Json(request): Json<TextRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.text.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "text must not be empty"));
    }
    let id = parse_session(&raw)?;
    state.relay.orchestrator.send_text(&id, &request.text)?;
    Ok(Json(json!({
        "sessionId": id,
        "status": "sent",
        "timestamp": now_millis(),
    })))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn ws_handler(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let ctx = state.relay.clone();
    ws.on_upgrade(move |socket| relay::serve_connection(socket, ctx))
}
