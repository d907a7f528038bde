use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinError;

use crate::provider::ProviderError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Ownership error: {0}")]
    Ownership(String),
    #[error("Provider temporarily unavailable: {0}")]
    ProviderTransient(String),
    #[error("Provider error: {0}")]
    Provider(String),
    #[error("{operation} timed out after {}ms", after.as_millis())]
    Timeout { operation: String, after: Duration },
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("HTTP request error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl AppError {
    /// Whether the same call may be repeated within the current invocation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::ProviderTransient(_))
    }

    /// Whether a queued operation that failed with this error should be delivered again.
    pub fn is_redeliverable(&self) -> bool {
        !matches!(
            self,
            AppError::Validation(_)
                | AppError::NotFound(_)
                | AppError::Ownership(_)
                | AppError::InvalidTransition(_)
                | AppError::Serde(_)
        )
    }

    pub fn status_code(&self) -> u16 {
        match self {
            AppError::Validation(_) => 400,
            AppError::NotFound(_) | AppError::Ownership(_) => 404,
            _ => 500,
        }
    }

    /// Message safe to hand back to a caller. Ownership failures are reported
    /// as a plain miss so a foreign tenant cannot probe for document ids.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Ownership(resource) => format!("Not found: {resource}"),
            other => other.to_string(),
        }
    }
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::NotFound(msg) => AppError::NotFound(msg),
            ProviderError::Unavailable(msg) => AppError::ProviderTransient(msg),
            ProviderError::AlreadyExists(msg) | ProviderError::Rejected(msg) => {
                AppError::Provider(msg)
            }
        }
    }
}
