use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Main error type for the relay.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("unauthorized: missing or invalid bearer token")]
    Unauthorized,

    #[error("no extension connected")]
    ExtensionUnavailable,

    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("no such target: {0}")]
    NoSuchTarget(String),

    #[error("relay is shutting down")]
    Shutdown,

    #[error("extension protocol error: {0}")]
    ExtensionProtocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),
}

pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn session_not_found(session_id: impl Into<String>) -> Self {
        Self::SessionNotFound(session_id.into())
    }

    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self::InvalidParams(msg.into())
    }

    pub fn no_such_target(target_id: impl Into<String>) -> Self {
        Self::NoSuchTarget(target_id.into())
    }

    /// JSON-RPC-ish error code used when this error is reported to a CDP client.
    pub fn cdp_code(&self) -> i32 {
        match self {
            Self::SessionNotFound(_) => -32001,
            Self::InvalidParams(_) | Self::NoSuchTarget(_) => -32602,
            _ => -32000,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::ExtensionUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::BadRequest(_) | Self::InvalidParams(_) | Self::Json(_) | Self::Url(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::SessionNotFound(_) | Self::NoSuchTarget(_) => StatusCode::NOT_FOUND,
            Self::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
            Self::ExtensionProtocol(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = json!({
            "error": {
                "code": self.cdp_code(),
                "message": self.to_string(),
            }
        });

        (status, axum::Json(body)).into_response()
    }
}
