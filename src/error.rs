//! Error types for Mnemo

use thiserror::Error;

/// Result type alias for Mnemo operations
pub type Result<T> = std::result::Result<T, MnemoError>;

/// Main error type for Mnemo
#[derive(Error, Debug)]
pub enum MnemoError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Memory not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Provider unavailable: {0}")]
    Provider(String),

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Job error: {0}")]
    Job(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MnemoError {
    /// Check if error is retryable inside the job queue
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MnemoError::Provider(_)
                | MnemoError::Http(_)
                | MnemoError::Embedding(_)
                | MnemoError::Job(_)
        )
    }

    /// HTTP status code for the API surface
    pub fn status(&self) -> u16 {
        match self {
            MnemoError::InvalidInput(_) => 400,
            MnemoError::Forbidden(_) => 403,
            MnemoError::NotFound(_) => 404,
            MnemoError::DeadlineExceeded => 504,
            _ => 500,
        }
    }
}
