use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    ConnectionRejected,
    NoTargetContainer,
    SpawnFailure,
    ProcessExit,
    SessionBusy,
    TooManySessions,
    UpstreamUnavailable,
    IoError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub error_code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiError {
    pub fn new(error_code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Colored one-line diagnostic rendered inside the terminal viewport.
    pub fn terminal_notice(&self) -> String {
        match &self.details {
            Some(details) => format!(
                "\r\n\x1b[1;31mError: {}: {}\x1b[0m\r\n",
                self.message, details
            ),
            None => format!("\r\n\x1b[1;31mError: {}\x1b[0m\r\n", self.message),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self.error_code {
            ErrorCode::InvalidArgument | ErrorCode::ConnectionRejected => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::SessionBusy => StatusCode::CONFLICT,
            ErrorCode::TooManySessions => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            ErrorCode::NoTargetContainer
            | ErrorCode::SpawnFailure
            | ErrorCode::ProcessExit
            | ErrorCode::IoError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_code, self.message)
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    success: bool,
    message: &'a str,
    error_code: &'a ErrorCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a str>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            success: false,
            message: &self.message,
            error_code: &self.error_code,
            details: self.details.as_deref(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("{0}")]
    Api(ApiError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Socket error: {0}")]
    Axum(#[from] axum::Error),
}

impl From<ApiError> for RelayError {
    fn from(value: ApiError) -> Self {
        Self::Api(value)
    }
}

impl RelayError {
    /// Error code of an API error, if this is one.
    pub fn code(&self) -> Option<&ErrorCode> {
        match self {
            RelayError::Api(api) => Some(&api.error_code),
            _ => None,
        }
    }

    pub fn into_api(self) -> ApiError {
        match self {
            RelayError::Api(api) => api,
            other => ApiError::new(ErrorCode::IoError, "Internal error").with_details(other.to_string()),
        }
    }
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::ConnectionRejected => "CONNECTION_REJECTED",
            ErrorCode::NoTargetContainer => "NO_TARGET_CONTAINER",
            ErrorCode::SpawnFailure => "SPAWN_FAILURE",
            ErrorCode::ProcessExit => "PROCESS_EXIT",
            ErrorCode::SessionBusy => "SESSION_BUSY",
            ErrorCode::TooManySessions => "TOO_MANY_SESSIONS",
            ErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ErrorCode::IoError => "IO_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
