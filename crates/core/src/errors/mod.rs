//! Error types and Result alias for the alert engine

use thiserror::Error;

/// Main error type for the alert engine
#[derive(Error, Debug)]
pub enum Error {
    #[error("API request failed: {0}")]
    ApiError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Integrity violation: {0}")]
    IntegrityError(String),

    #[error("Model not found: {0}")]
    ModelNotFound(i64),

    #[error("Prediction not found: {0}")]
    PredictionNotFound(i64),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl Error {
    /// Whether the failure is worth retrying (I/O that may succeed later)
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::NetworkError(_) | Error::DatabaseError(_) | Error::ApiError(_) | Error::Timeout(_)
        )
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout(err.to_string())
        } else {
            Error::NetworkError(err.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}
