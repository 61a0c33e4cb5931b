//! Stateless edge: validates the upgrade, opens the hop to the session service
//! and relays frames verbatim in both directions.

use crate::error::{ApiError, ErrorCode, RelayError};
use crate::server::HealthResponse;
use axum::extract::ws::{
    CloseFrame as AxumCloseFrame, Message as AxumMessage, WebSocket, WebSocketUpgrade, close_code,
};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

#[derive(Clone)]
pub struct EdgeState {
    /// Session service base, e.g. `ws://terminal-service:3006`.
    pub upstream: Arc<str>,
}

impl EdgeState {
    pub fn new(upstream: impl Into<String>) -> Self {
        Self {
            upstream: Arc::from(upstream.into()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeConnectParams {
    pub user_id: Option<String>,
    pub term_id: Option<String>,
    pub container_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayTarget {
    pub user_id: String,
    pub term_id: String,
    pub container_id: Option<String>,
}

impl EdgeConnectParams {
    pub fn validate(self) -> Result<RelayTarget, ApiError> {
        let user_id = self.user_id.filter(|value| !value.is_empty());
        let term_id = self.term_id.filter(|value| !value.is_empty());
        match (user_id, term_id) {
            (Some(user_id), Some(term_id)) => Ok(RelayTarget {
                user_id,
                term_id,
                container_id: self.container_id.filter(|value| !value.is_empty()),
            }),
            _ => Err(ApiError::new(
                ErrorCode::ConnectionRejected,
                "Missing userId or termId",
            )),
        }
    }
}

/// Per-session upstream URL; the session id is the terminal id.
pub fn upstream_url(base: &str, target: &RelayTarget) -> String {
    let mut url = format!(
        "{}/ws/{}",
        base.trim_end_matches('/'),
        urlencoding::encode(&target.term_id)
    );
    if let Some(container_id) = &target.container_id {
        url.push_str("?containerId=");
        url.push_str(&urlencoding::encode(container_id));
    }
    url
}

pub fn edge_router(state: EdgeState) -> Router {
    Router::new()
        .route("/ws", get(edge_socket))
        .route("/health", get(edge_health))
        .with_state(state)
}

async fn edge_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: crate::version::SHORT_VERSION.to_string(),
        sessions: None,
    })
}

async fn edge_socket(
    ws: WebSocketUpgrade,
    Query(params): Query<EdgeConnectParams>,
    State(state): State<EdgeState>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        match params.validate() {
            Ok(target) => relay(socket, &state.upstream, target).await,
            Err(api) => {
                tracing::warn!(error = %api, "Rejecting edge connection");
                close_client(socket, close_code::POLICY, &api.message).await;
            }
        }
    })
}

async fn close_client(mut socket: WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(AxumMessage::Close(Some(AxumCloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

async fn relay(client: WebSocket, upstream: &str, target: RelayTarget) {
    let url = upstream_url(upstream, &target);
    let upstream_socket = match connect_async(url.as_str()).await {
        Ok((socket, _)) => socket,
        Err(err) => {
            let api = ApiError::new(ErrorCode::UpstreamUnavailable, "Session service unavailable")
                .with_details(err.to_string());
            tracing::warn!(
                term_id = %target.term_id,
                url = %url,
                error = %api,
                details = ?api.details,
                "Upstream connect failed"
            );
            close_client(client, close_code::ERROR, &api.message).await;
            return;
        }
    };
    tracing::info!(
        user_id = %target.user_id,
        term_id = %target.term_id,
        container_id = ?target.container_id,
        "Relay established"
    );

    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream_socket.split();

    let client_to_upstream = async {
        while let Some(message) = client_rx.next().await {
            let message = message?;
            let closing = matches!(message, AxumMessage::Close(_));
            upstream_tx.send(to_upstream(message)).await?;
            if closing {
                break;
            }
        }
        Ok::<(), RelayError>(())
    };

    let upstream_to_client = async {
        while let Some(message) = upstream_rx.next().await {
            let message = message?;
            let closing = matches!(message, UpstreamMessage::Close(_));
            let Some(forward) = to_client(message) else {
                continue;
            };
            client_tx.send(forward).await?;
            if closing {
                break;
            }
        }
        Ok::<(), RelayError>(())
    };

    let (leg, result) = tokio::select! {
        result = client_to_upstream => ("client", result),
        result = upstream_to_client => ("upstream", result),
    };
    match result {
        Ok(()) => tracing::info!(term_id = %target.term_id, leg, "Relay closed"),
        Err(err) => tracing::warn!(term_id = %target.term_id, leg, error = %err, "Relay failed"),
    }

    let _ = upstream_tx.close().await;
    let _ = client_tx.close().await;
}

fn to_upstream(message: AxumMessage) -> UpstreamMessage {
    match message {
        AxumMessage::Text(text) => UpstreamMessage::Text(text),
        AxumMessage::Binary(data) => UpstreamMessage::Binary(data),
        AxumMessage::Ping(data) => UpstreamMessage::Ping(data),
        AxumMessage::Pong(data) => UpstreamMessage::Pong(data),
        AxumMessage::Close(frame) => UpstreamMessage::Close(frame.map(|frame| UpstreamCloseFrame {
            code: CloseCode::from(frame.code),
            reason: frame.reason,
        })),
    }
}

fn to_client(message: UpstreamMessage) -> Option<AxumMessage> {
    let forward = match message {
        UpstreamMessage::Text(text) => AxumMessage::Text(text),
        UpstreamMessage::Binary(data) => AxumMessage::Binary(data),
        UpstreamMessage::Ping(data) => AxumMessage::Ping(data),
        UpstreamMessage::Pong(data) => AxumMessage::Pong(data),
        UpstreamMessage::Close(frame) => AxumMessage::Close(frame.map(|frame| AxumCloseFrame {
            code: u16::from(frame.code),
            reason: frame.reason,
        })),
        UpstreamMessage::Frame(_) => return None,
    };
    Some(forward)
}
