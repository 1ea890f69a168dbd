//! Axum-facing error wrapper: translates `termcast_core::error::CoreError`
//! into an HTTP status + JSON body.

use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde_json::json;
use termcast_core::error::CoreError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("rate limit exceeded")]
    RateLimited,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, error_type) = match &self {
            ApiError::Core(CoreError::NotFound(msg)) => {
                (StatusCode::NOT_FOUND, msg.clone(), "not_found")
            }
            ApiError::Core(CoreError::Conflict(msg)) => {
                (StatusCode::CONFLICT, msg.clone(), "conflict")
            }
            ApiError::Core(CoreError::ConfigError(msg)) => {
                (StatusCode::BAD_REQUEST, msg.clone(), "bad_request")
            }
            ApiError::Core(CoreError::SpawnFailed(msg)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, msg.clone(), "spawn_failed")
            }
            ApiError::Core(CoreError::ResourceExhausted(msg)) => {
                (StatusCode::SERVICE_UNAVAILABLE, msg.clone(), "resource_exhausted")
            }
            ApiError::Core(CoreError::AuthFailed) => {
                (StatusCode::UNAUTHORIZED, "authentication failed".to_string(), "auth_failed")
            }
            ApiError::Core(CoreError::WouldBlock) => {
                (StatusCode::TOO_MANY_REQUESTS, "operation would block".to_string(), "would_block")
            }
            ApiError::Core(CoreError::Shutdown) => {
                (StatusCode::SERVICE_UNAVAILABLE, "server is shutting down".to_string(), "shutdown")
            }
            ApiError::Core(CoreError::Io(e)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), "io_error")
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone(), "bad_request"),
            ApiError::Unauthorized => {
                (StatusCode::UNAUTHORIZED, "unauthorized".to_string(), "unauthorized")
            }
            ApiError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate limit exceeded".to_string(),
                "rate_limited",
            ),
        };

        let body = Json(json!({
            "error": {
                "message": message,
                "type": error_type,
            }
        }));
        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;
