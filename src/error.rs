use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Application-level errors
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum AppError {
    /// Network failure or 5xx from an upstream API. Retryable later.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Upstream asked us to slow down. Halts paging/enrichment for the run.
    #[error("Upstream rate limited{}", retry_hint(.retry_after_secs))]
    UpstreamRateLimited { retry_after_secs: Option<u64> },

    /// The durable document store could not be reached.
    #[error("Cache backend unavailable: {0}")]
    CacheBackendUnavailable(String),

    /// Upstream payload did not match the expected shape.
    #[error("Invalid response shape: {0}")]
    InvalidResponseShape(String),

    /// The secondary API has no record for the item.
    #[error("Enrichment not found: {0}")]
    EnrichmentNotFound(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

fn retry_hint(retry_after_secs: &Option<u64>) -> String {
    match retry_after_secs {
        Some(secs) => format!(" (retry after {}s)", secs),
        None => String::new(),
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            AppError::InvalidResponseShape(err.to_string())
        } else {
            AppError::UpstreamUnavailable(err.to_string())
        }
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::CacheBackendUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InvalidResponseShape(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound(_) | AppError::EnrichmentNotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::UpstreamRateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::UpstreamUnavailable(_) | AppError::InvalidResponseShape(_) => {
                StatusCode::BAD_GATEWAY
            }
            AppError::CacheBackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
