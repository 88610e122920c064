//! Error types and handling for the chat proxy server.
//!
//! This module provides a unified error type [`AppError`] for the request path
//! and implements proper HTTP response conversion. Telemetry failures have
//! their own type, [`TelemetryError`], because they never reach the caller.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Error type reported in the JSON body of proxy-generated failures.
pub const ERROR_TYPE_API: &str = "api_error";

/// Error type reported for deadline expiry.
pub const ERROR_TYPE_TIMEOUT: &str = "timeout_error";

/// Main error type for the request path.
#[derive(Error, Debug)]
pub enum AppError {
    /// The upstream call did not produce a response before the deadline
    #[error("Upstream request timed out after {}s", .after.as_secs())]
    UpstreamTimeout { after: Duration },

    /// Transport-level failure talking to upstream
    #[error("Upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    /// The resolved upstream URL could not be used
    #[error("Invalid upstream target: {0}")]
    InvalidTarget(String),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Client provided a body the proxy could not read
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Generic internal server errors with custom message
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// Coarse classification used for metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::UpstreamTimeout { .. } => "timeout",
            AppError::Upstream(e) if e.is_timeout() => "timeout",
            AppError::Upstream(e) if e.is_connect() => "connect",
            AppError::Upstream(_) => "other",
            AppError::InvalidTarget(_) => "target",
            AppError::Serialization(_) => "serialization",
            AppError::BadRequest(_) => "bad_request",
            AppError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, error_message) = match &self {
            AppError::UpstreamTimeout { .. } => (
                StatusCode::GATEWAY_TIMEOUT,
                ERROR_TYPE_TIMEOUT,
                self.to_string(),
            ),
            // Sanitize transport errors: reqwest messages can carry upstream URLs.
            AppError::Upstream(e) if e.is_timeout() => (
                StatusCode::GATEWAY_TIMEOUT,
                ERROR_TYPE_TIMEOUT,
                "Upstream request timed out".to_string(),
            ),
            AppError::Upstream(e) if e.is_connect() => (
                StatusCode::BAD_GATEWAY,
                ERROR_TYPE_API,
                "Failed to connect to upstream".to_string(),
            ),
            AppError::Upstream(_) => (
                StatusCode::BAD_GATEWAY,
                ERROR_TYPE_API,
                "Upstream request failed".to_string(),
            ),
            AppError::InvalidTarget(_) | AppError::Serialization(_) | AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ERROR_TYPE_API,
                self.to_string(),
            ),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, ERROR_TYPE_API, msg.clone()),
        };

        let body = Json(json!({
            "error": {
                "message": error_message,
                "type": error_type,
                "code": status.as_u16()
            }
        }));

        (status, body).into_response()
    }
}

/// Convenience type alias for Results using [`AppError`].
pub type Result<T> = std::result::Result<T, AppError>;

/// Failures delivering usage records to the telemetry backend.
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("telemetry queue is full")]
    QueueFull,

    #[error("telemetry worker has shut down")]
    Closed,

    #[error("telemetry backend rejected batch: {status} {body}")]
    Rejected { status: u16, body: String },

    #[error("telemetry transport error: {0}")]
    Transport(#[from] reqwest::Error),
}
