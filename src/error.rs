//! Domain-specific error types for counterpoint

use thiserror::Error;

/// Main error type for the counterpoint analysis service
#[derive(Error, Debug)]
pub enum CounterpointError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Upstream error: {message}")]
    Upstream { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Analysis unavailable: {message}")]
    Unavailable { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl CounterpointError {
    /// Machine-readable code used on the HTTP surface
    pub fn code(&self) -> &'static str {
        match self {
            CounterpointError::Config { .. } => "CONFIG_ERROR",
            CounterpointError::Storage { .. } => "STORAGE_ERROR",
            CounterpointError::Upstream { .. } => "UPSTREAM_ERROR",
            CounterpointError::Serialization { .. } => "SERIALIZATION_ERROR",
            CounterpointError::Validation { .. } => "INVALID_REQUEST",
            CounterpointError::Unavailable { .. } => "ANALYSIS_UNAVAILABLE",
            CounterpointError::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        CounterpointError::Validation {
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for CounterpointError {
    fn from(err: anyhow::Error) -> Self {
        CounterpointError::Internal {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CounterpointError {
    fn from(err: serde_json::Error) -> Self {
        CounterpointError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<rusqlite::Error> for CounterpointError {
    fn from(err: rusqlite::Error) -> Self {
        CounterpointError::Storage {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for CounterpointError {
    fn from(err: reqwest::Error) -> Self {
        CounterpointError::Upstream {
            message: format!("HTTP request failed: {}", err),
        }
    }
}

impl From<toml::de::Error> for CounterpointError {
    fn from(err: toml::de::Error) -> Self {
        CounterpointError::Config {
            message: err.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for CounterpointError {
    fn from(err: tokio::task::JoinError) -> Self {
        CounterpointError::Internal {
            message: format!("background task failed: {}", err),
        }
    }
}

/// Result type alias for counterpoint operations
pub type Result<T> = std::result::Result<T, CounterpointError>;
