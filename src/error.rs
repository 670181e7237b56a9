//! Error types for the twin sync service

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, TwinError>;

/// Twin sync error taxonomy
#[derive(Error, Debug)]
pub enum TwinError {
    /// Unknown device. Fatal to the call, never retried.
    #[error("Device not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency lost on a desired patch
    #[error("Version conflict: expected {expected}, actual {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    #[error("Operation cancelled: session closed")]
    Cancelled,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TwinError {
    /// Transport-level failures that recovery retries with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, TwinError::ConnectionLost(_) | TwinError::Timeout(_))
    }
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for TwinError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            TwinError::NotFound(id) => (
                StatusCode::NOT_FOUND,
                "not_found",
                format!("Device not found: {}", id),
            ),
            TwinError::VersionConflict { .. } => (
                StatusCode::PRECONDITION_FAILED,
                "version_conflict",
                self.to_string(),
            ),
            TwinError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            TwinError::ConnectionLost(msg) => {
                tracing::warn!("Connection lost: {}", msg);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "connection_lost",
                    "Connection lost".to_string(),
                )
            }
            TwinError::Timeout(_) => (
                StatusCode::GATEWAY_TIMEOUT,
                "timeout",
                self.to_string(),
            ),
            TwinError::Cancelled => (
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
                "cancelled",
                self.to_string(),
            ),
            TwinError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                )
            }
            TwinError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "database_error",
                    "Database error".to_string(),
                )
            }
            TwinError::Serialization(e) => {
                tracing::error!("Serialization error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "serialization_error",
                    "Failed to encode twin document".to_string(),
                )
            }
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
            details: if cfg!(debug_assertions) {
                Some(self.to_string())
            } else {
                None
            },
        });

        (status, body).into_response()
    }
}
