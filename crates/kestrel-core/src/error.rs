use thiserror::Error;
use uuid::Uuid;

use crate::routine::RoutineError;
use crate::run::RunStatus;

/// Application-wide error types for Kestrel.
#[derive(Error, Debug)]
pub enum AppError {
    /// A scraper with this name is already registered and overwrite was not requested.
    #[error("Scraper already registered: {0}")]
    DuplicateScraper(String),

    /// The scraper definition is malformed.
    #[error("Invalid scraper definition: {0}")]
    InvalidDefinition(String),

    #[error("Unknown scraper: {0}")]
    UnknownScraper(String),

    /// Run input does not match the scraper's input schema.
    #[error("Invalid input at '{path}': {message}")]
    Validation { path: String, message: String },

    /// Both the concurrent and the queued run limits are exhausted.
    #[error(
        "Scraper '{scraper}' is at capacity ({max_concurrent} running, {max_queued} queued)"
    )]
    CapacityExceeded {
        scraper: String,
        max_concurrent: usize,
        max_queued: usize,
    },

    #[error("Unknown run: {0}")]
    UnknownRun(Uuid),

    #[error("Run {run_id} is already in terminal state: {status}")]
    AlreadyTerminal { run_id: Uuid, status: RunStatus },

    /// A run record was asked to make a transition its state machine does not allow.
    #[error("Run {run_id} cannot move from {from} to {to}")]
    InvalidTransition {
        run_id: Uuid,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("Unknown filter '{filter}' for scraper '{scraper}'")]
    UnknownFilter { scraper: String, filter: String },

    #[error("Unknown sort '{sort}' for scraper '{scraper}'")]
    UnknownSort { scraper: String, sort: String },

    #[error("Unknown view '{view}' for scraper '{scraper}'")]
    UnknownView { scraper: String, view: String },

    /// The scraper routine itself failed.
    #[error("Routine failed: {0}")]
    RoutineExecution(#[from] RoutineError),

    /// The automation session for a run could not be acquired.
    #[error("Session error: {0}")]
    SessionError(String),

    /// The automation session for a run did not release cleanly.
    #[error("Resource release failed: {0}")]
    ResourceRelease(String),

    /// Run record store operation failed.
    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The orchestrator is shutting down and no longer admits runs.
    #[error("Orchestrator is shutting down")]
    ShuttingDown,

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl AppError {
    /// Shorthand for a [`AppError::Validation`] error.
    pub fn validation(path: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::Validation {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Returns true if resubmitting the same request later may succeed.
    ///
    /// Capacity rejections and store hiccups are transient; validation and
    /// lookup failures need the caller to change the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::CapacityExceeded { .. } | AppError::StoreError(_) | AppError::ShuttingDown
        )
    }

}
