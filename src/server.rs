use crate::error::{ApiError, ErrorCode, RelayResult};
use crate::session::{CreateSessionRequest, SessionInfo, SessionManager, bridge_socket};
use axum::{Json, Router};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Clone)]
pub struct ServiceState {
    pub manager: Arc<SessionManager>,
    pub public_ws_base: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionSocketParams {
    pub container_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub success: bool,
    pub session_id: String,
    pub websocket_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionListResponse {
    pub success: bool,
    pub sessions: Vec<SessionInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AckResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sessions: Option<usize>,
}

/// Routes of the session service. The socket path is only meant to be reached
/// through the edge router.
pub fn service_router(state: ServiceState) -> Router {
    Router::new()
        .route("/ws/:session_id", get(session_socket))
        .route("/session", post(create_session))
        .route("/sessions/:id", get(list_user_sessions).delete(kill_session))
        .route("/health", get(health))
        .with_state(state)
}

async fn session_socket(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    Query(params): Query<SessionSocketParams>,
    State(state): State<ServiceState>,
) -> Response {
    let container_id = params
        .container_id
        .filter(|value| !value.trim().is_empty());
    tracing::debug!(session_id = %session_id, container_id = ?container_id, "Terminal upgrade");
    ws.on_upgrade(move |socket| bridge_socket(socket, state.manager, session_id, container_id))
}

async fn create_session(
    State(state): State<ServiceState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    let session = state
        .manager
        .create_session(request)
        .await
        .map_err(|err| err.into_api())?;
    Ok(Json(CreateSessionResponse {
        success: true,
        websocket_url: format!(
            "{}/ws/{}",
            state.public_ws_base.trim_end_matches('/'),
            session.id
        ),
        session_id: session.id.clone(),
    }))
}

async fn list_user_sessions(
    State(state): State<ServiceState>,
    Path(user_id): Path<String>,
) -> Json<SessionListResponse> {
    Json(SessionListResponse {
        success: true,
        sessions: state.manager.list_sessions(Some(&user_id)).await,
    })
}

async fn kill_session(
    State(state): State<ServiceState>,
    Path(session_id): Path<String>,
) -> Result<Json<AckResponse>, ApiError> {
    state
        .manager
        .kill_session(&session_id)
        .await
        .map_err(|err| err.into_api())?;
    Ok(Json(AckResponse {
        success: true,
        message: "Session killed".to_string(),
    }))
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: crate::version::SHORT_VERSION.to_string(),
        sessions: Some(state.manager.len().await),
    })
}

/// Bind `listen` and serve `router` until `shutdown` resolves.
pub async fn serve_until<F>(listen: &str, router: Router, shutdown: F) -> RelayResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr: SocketAddr = listen
        .parse()
        .map_err(|_| ApiError::new(ErrorCode::InvalidArgument, "Invalid listen address"))?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|err| {
        ApiError::new(ErrorCode::IoError, "HTTP bind failed").with_details(err.to_string())
    })?;
    tracing::info!(listen = %addr, "Listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|err| {
            ApiError::new(ErrorCode::IoError, "HTTP server failed").with_details(err.to_string())
        })?;
    Ok(())
}
