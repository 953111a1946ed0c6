//! Model error types

use std::time::Duration;
use thiserror::Error;

/// Errors a model collaborator can report
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ModelError {
    /// Check if this is a rate limit error
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ModelError::RateLimited { .. })
    }

    /// Check if this error is worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            ModelError::RateLimited { .. } => true,
            ModelError::Api { status, .. } => *status >= 500,
            ModelError::Timeout(_) => true,
            ModelError::InvalidResponse(_) => false,
            ModelError::Json(_) => false,
        }
    }

    /// Get the retry duration if this is a rate limit error
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ModelError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}
