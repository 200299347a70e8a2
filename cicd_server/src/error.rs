//! Error types for the CI/CD engine.

use thiserror::Error;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, CicdError>;

/// Main error type for the CI/CD engine.
#[derive(Error, Debug)]
pub enum CicdError {
    /// Pipeline document or job definition rejected before anything was stored.
    #[error("Definition error: {0}")]
    Definition(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Cluster error: {0}")]
    Cluster(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CicdError {
    /// True for the timeout and cancellation variants, which callers record with
    /// their own status rather than as a plain failure.
    pub fn is_interruption(&self) -> bool {
        matches!(self, CicdError::Timeout(_) | CicdError::Cancelled)
    }
}
