use std::time::Duration;

use thiserror::Error;

use crate::models::Stage;

/// Errors raised across the lesson pipeline.
#[derive(Debug, Error)]
pub enum CadenceError {
    /// Malformed input. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// A referenced entity is missing upstream.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A required template placeholder had no bound value.
    #[error("template error rendering {stage}: missing {placeholder}")]
    Template {
        stage: Stage,
        placeholder: &'static str,
    },

    /// The hand-off to the tutor surface did not finish in time.
    #[error("dispatch timed out after {0:?}")]
    DispatchTimeout(Duration),

    /// The hand-off to the tutor surface or image service failed.
    #[error("dispatch failed: {0}")]
    Dispatch(String),

    /// Lost a compare-and-set race on a job and could not recover.
    #[error("concurrent update conflict on {0}")]
    ConcurrencyConflict(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl CadenceError {
    /// Whether a failed dispatch attempt may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DispatchTimeout(_) | Self::Dispatch(_))
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

impl From<sqlx::Error> for CadenceError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for CadenceError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::Storage(err.to_string())
    }
}

pub type Result<T, E = CadenceError> = std::result::Result<T, E>;
