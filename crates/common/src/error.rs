use std::time::Duration;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Persistence failures: the store is unreachable, slow, or rejected a write.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Failures of the live delivery channel.
///
/// The connection manager does not distinguish causes, only frequency;
/// the variants exist for logging.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Subscription failed: {0}")]
    Subscribe(String),

    #[error("Channel closed")]
    Closed,

    #[error("Channel operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Heartbeat timeout: no liveness signal for {0:?}")]
    HeartbeatTimeout(Duration),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Poll failed: {0}")]
    Poll(#[from] StoreError),
}

/// Common error types surfaced over HTTP.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Store(StoreError::Timeout(_)) => {
                (StatusCode::GATEWAY_TIMEOUT, self.to_string())
            }
            AppError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        };

        let body = json!({ "error": message });
        (status, Json(body)).into_response()
    }
}
