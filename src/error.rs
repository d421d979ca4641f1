//! Error types for the ingestion, transform and validation stages.
//!
//! Every stage returns one of these to the orchestrator instead of swallowing
//! the failure; the orchestrator decides whether to record and continue.

use std::time::Duration;
use thiserror::Error;

/// Storage failure from a [`crate::db::SeriesStore`].
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A stored row could not be mapped back into the model
    #[error("Corrupt record for '{dataset_id}': {reason}")]
    Corrupt { dataset_id: String, reason: String },
}

/// Per (entity, metric) failure. Recoverable: the stage moves on.
#[derive(Error, Debug)]
pub enum FetchError {
    /// The request URL is stripped on conversion; it can carry credentials
    #[error("HTTP error: {0}")]
    Http(#[source] reqwest::Error),

    #[error("API error {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Unexpected response format: {0}")]
    Format(String),

    #[error("Failed to persist series: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Fetch cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        FetchError::Http(e.without_url())
    }
}

impl FetchError {
    /// Transport errors, throttling and server errors are worth another try.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            FetchError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Missing provider credential. Disables the whole provider stage.
#[derive(Error, Debug, Clone)]
#[error("{provider} credential unavailable: {reason}")]
pub struct AuthError {
    pub provider: String,
    pub reason: String,
}

/// Failure of one validator invocation.
#[derive(Error, Debug)]
pub enum ValidatorProcessError {
    #[error("Failed to prepare interchange file: {0}")]
    ScratchFile(std::io::Error),

    #[error("Failed to spawn validator: {0}")]
    Spawn(std::io::Error),

    #[error("Validator timed out after {0:?}")]
    Timeout(Duration),

    #[error("Validator exited with {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("Validator output was not a JSON result object (stderr: {stderr})")]
    MalformedOutput { stderr: String },

    #[error("Validation cancelled")]
    Cancelled,
}

impl ValidatorProcessError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ValidatorProcessError::Spawn(_)
                | ValidatorProcessError::Timeout(_)
                | ValidatorProcessError::NonZeroExit { .. }
        )
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}
