use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::routine::RoutineError;

/// Status of a scraper run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(RunStatus::Queued),
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            _ => Err(format!("Unknown run status: {}", s)),
        }
    }
}

/// One execution attempt of a scraper against a specific input.
///
/// Status changes go through the transition methods, which keep `result`
/// and `error` consistent with the status: `result` is set only on
/// `succeeded`, `error` only on `failed`, and neither on any other status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub scraper_name: String,
    pub input: serde_json::Value,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<RoutineError>,
}

impl RunRecord {
    /// Create a fresh `queued` record with a new run id.
    pub fn queued(scraper_name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            scraper_name: scraper_name.into(),
            input,
            status: RunStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
        }
    }

    /// Admission order: oldest first, lower run id on identical timestamps.
    pub fn fifo_cmp(&self, other: &RunRecord) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.id.cmp(&other.id))
    }

    pub fn start(&mut self) -> Result<(), AppError> {
        self.transition(RunStatus::Queued, RunStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn succeed(&mut self, result: serde_json::Value) -> Result<(), AppError> {
        self.transition(RunStatus::Running, RunStatus::Succeeded)?;
        self.result = Some(result);
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn fail(&mut self, error: RoutineError) -> Result<(), AppError> {
        self.transition(RunStatus::Running, RunStatus::Failed)?;
        self.error = Some(error);
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Cancel a queued or running record.
    pub fn cancel(&mut self) -> Result<(), AppError> {
        if self.status.is_terminal() {
            return Err(AppError::AlreadyTerminal {
                run_id: self.id,
                status: self.status,
            });
        }
        self.status = RunStatus::Cancelled;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    fn transition(&mut self, from: RunStatus, to: RunStatus) -> Result<(), AppError> {
        if self.status != from {
            if self.status.is_terminal() {
                return Err(AppError::AlreadyTerminal {
                    run_id: self.id,
                    status: self.status,
                });
            }
            return Err(AppError::InvalidTransition {
                run_id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}
