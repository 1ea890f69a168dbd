//! Error taxonomy for termcast-core (spec.md §7).

use thiserror::Error;

/// Core error type. Maps 1:1 onto the taxonomy in spec.md §7; the HTTP
/// status mapping lives in `termcast-server::error::ApiError`.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("failed to spawn child process: {0}")]
    SpawnFailed(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("authentication failed")]
    AuthFailed,

    #[error("operation would block")]
    WouldBlock,

    #[error("server is shutting down")]
    Shutdown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
