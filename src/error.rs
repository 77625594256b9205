//! # Error Handling
//!
//! Two families of errors live here:
//!
//! - **AppError**: what HTTP handlers return; converted to a JSON response by
//!   the `ResponseError` impl.
//! - **Collaborator errors** (`TranscriptionError`, `SynthesisError`,
//!   `ReasoningError`, `MemoryError`): what the external services report to
//!   the voice session. None of them ever unwinds past the pipeline stage that
//!   observed it; see `voice::pipeline` for how each one is recovered.
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "validation_error",
//!     "message": "Interruption debounce must be greater than 0",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;

/// Custom error types for the HTTP surface.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Internal server errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// Client sent invalid or malformed data
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Requested resource was not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration file or environment variable problems
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// User input failed validation rules
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A collaborator needed by the request is not reachable
    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl AppError {
    fn kind(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::ConfigError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
            AppError::ValidationError(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            AppError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable"),
        }
    }

    fn message(&self) -> &str {
        match self {
            AppError::Internal(msg)
            | AppError::BadRequest(msg)
            | AppError::NotFound(msg)
            | AppError::ConfigError(msg)
            | AppError::ValidationError(msg)
            | AppError::Unavailable(msg) => msg,
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.kind().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type) = self.kind();

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": self.message(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<MemoryError> for AppError {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::InvalidConversation(_) => AppError::BadRequest(err.to_string()),
        }
    }
}

/// Failures of the live transcription source.
#[derive(Debug, thiserror::Error)]
pub enum TranscriptionError {
    #[error("transcription source is not configured: {0}")]
    NotConfigured(String),

    #[error("failed to connect to transcription source: {0}")]
    Connect(String),

    /// The source went away; audio can no longer be forwarded.
    #[error("transcription source closed")]
    Closed,
}

/// Failures of the speech synthesis source.
#[derive(Debug, thiserror::Error)]
pub enum SynthesisError {
    #[error("speech synthesis is not configured: {0}")]
    NotConfigured(String),

    #[error("synthesis request failed: {0}")]
    Request(String),

    #[error("synthesis service returned HTTP {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("synthesis stream interrupted: {0}")]
    Stream(String),
}

/// Failures of the reasoning service.
///
/// `is_fatal` separates failures worth speaking a fallback for from failures
/// where the fallback is only shown: a backend that is not configured at all
/// will fail every turn the same way.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReasoningError {
    #[error("reasoning service is not configured: {0}")]
    NotConfigured(String),

    #[error("reasoning service rate limited the request")]
    RateLimited,

    #[error("reasoning service returned HTTP {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("reasoning request failed: {0}")]
    Transport(String),

    #[error("reasoning service returned an empty response")]
    EmptyResponse,
}

impl ReasoningError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReasoningError::NotConfigured(_))
    }
}

/// Failures of the memory store.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("invalid conversation id: {0:?}")]
    InvalidConversation(String),
}
