//! Error types shared by pipehost crates

use thiserror::Error;

/// Result type alias for host-level operations
pub type Result<T> = std::result::Result<T, HostError>;

/// Host-level error type
#[derive(Error, Debug)]
pub enum HostError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

impl HostError {
    pub fn invalid_value(key: impl Into<String>, value: impl Into<String>) -> Self {
        HostError::InvalidValue {
            key: key.into(),
            value: value.into(),
        }
    }
}
