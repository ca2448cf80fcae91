//! Error taxonomy for the I/O boundaries of the pipeline.
//!
//! Every fallible boundary returns one of four shapes so callers can decide
//! to surface, retry, or page without string matching.

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Bad input. Never retried, surfaced as 4xx with the offending field.
    #[error("validation failed on `{field}`: {message}")]
    Validation { field: String, message: String },

    /// Storage or LLM hiccup. Retriable with bounded backoff.
    #[error("transient dependency failure: {0}")]
    TransientDependency(String),

    /// Auth failure, schema mismatch. Surfaced, not retried.
    #[error("permanent dependency failure: {0}")]
    PermanentDependency(String),

    /// A core invariant broke (e.g. negative counter). Logged and paged;
    /// the offending operation is suppressed.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl CoreError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        CoreError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, CoreError::TransientDependency(_))
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            CoreError::Validation { .. } => StatusCode::BAD_REQUEST,
            CoreError::TransientDependency(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::PermanentDependency(_) => StatusCode::BAD_GATEWAY,
            CoreError::Invariant(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
