//! Error types for tabvault-relay.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// Main error type for relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A row held data that does not decode to its domain type.
    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

/// API-surface errors, mapped onto HTTP statuses.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Missing or invalid bearer token.
    #[error("unauthorized")]
    Unauthorized,

    /// The addressed resource does not exist.
    #[error("{0}")]
    NotFound(String),

    /// The request is well-formed but cannot be honored.
    #[error("{0}")]
    Rejected(String),

    /// The payload exceeds a configured limit.
    #[error("payload too large: {size} bytes (limit: {limit} bytes)")]
    PayloadTooLarge {
        /// Actual payload size.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// A request parameter failed to parse.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Storage failure; details stay server-side.
    #[error("internal error")]
    Internal(#[source] StorageError),
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        ApiError::Internal(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Rejected(_) => StatusCode::CONFLICT,
            ApiError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(e) => {
                tracing::error!(error = %e, "request failed on storage");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Result type alias for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
