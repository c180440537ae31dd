use std::future::Future;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::session::Session;

/// Failure reported by a scraper routine, stored verbatim on the failed run.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct RoutineError {
    /// Short machine-readable category (e.g. `"Timeout"`, `"Http"`).
    pub kind: String,
    pub message: String,
}

impl RoutineError {
    pub const CANCELLED: &'static str = "Cancelled";

    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// The error a routine returns after it stopped because of cancellation.
    pub fn cancelled() -> Self {
        Self::new(Self::CANCELLED, "run was cancelled")
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == Self::CANCELLED
    }
}

impl From<serde_json::Error> for RoutineError {
    fn from(err: serde_json::Error) -> Self {
        Self::new("Serialization", err.to_string())
    }
}

/// Everything a routine may need besides its input.
#[derive(Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub scraper_name: String,
    /// Signalled when someone cancels the run. Observing it is optional;
    /// routines that ignore it simply run to completion.
    pub cancel: CancellationToken,
    /// Scoped automation resource acquired for this run.
    pub session: Session,
}

impl RunContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Returns `Err(RoutineError::cancelled())` once cancellation was requested.
    ///
    /// Meant for `?` at convenient checkpoints inside a routine.
    pub fn checkpoint(&self) -> Result<(), RoutineError> {
        if self.cancel.is_cancelled() {
            Err(RoutineError::cancelled())
        } else {
            Ok(())
        }
    }
}

pub type RoutineFuture = BoxFuture<'static, Result<serde_json::Value, RoutineError>>;

/// The extraction logic behind a scraper.
///
/// Takes the validated, normalized input and returns the run's result.
/// Implemented for any `Fn(Value, RunContext) -> impl Future` closure.
pub trait Routine: Send + Sync {
    fn run(&self, input: serde_json::Value, ctx: RunContext) -> RoutineFuture;
}

impl<F, Fut> Routine for F
where
    F: Fn(serde_json::Value, RunContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, RoutineError>> + Send + 'static,
{
    fn run(&self, input: serde_json::Value, ctx: RunContext) -> RoutineFuture {
        Box::pin(self(input, ctx))
    }
}
