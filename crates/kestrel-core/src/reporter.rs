use uuid::Uuid;

use crate::routine::RoutineError;

/// Run lifecycle events emitted for monitoring/logging.
#[derive(Debug, Clone)]
pub enum RunEvent<'a> {
    Registered {
        scraper: &'a str,
        replaced: bool,
    },
    Admitted {
        run_id: Uuid,
        scraper: &'a str,
    },
    Queued {
        run_id: Uuid,
        scraper: &'a str,
    },
    Rejected {
        scraper: &'a str,
        reason: &'a str,
    },
    Started {
        run_id: Uuid,
        scraper: &'a str,
    },
    Succeeded {
        run_id: Uuid,
        scraper: &'a str,
    },
    Failed {
        run_id: Uuid,
        scraper: &'a str,
        error: &'a RoutineError,
    },
    Cancelled {
        run_id: Uuid,
        scraper: &'a str,
    },
    CancelRequested {
        run_id: Uuid,
    },
    Promoted {
        run_id: Uuid,
        scraper: &'a str,
    },
    Recovered {
        interrupted: usize,
        promoted: usize,
    },
    ShuttingDown {
        in_flight: usize,
    },
    Stopped,
}

/// Receiver for run events, decoupled from the orchestration logic.
pub trait RunReporter: Send + Sync {
    fn report(&self, event: RunEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRunReporter;

impl RunReporter for TracingRunReporter {
    fn report(&self, event: RunEvent<'_>) {
        match event {
            RunEvent::Registered { scraper, replaced } => {
                tracing::info!(%scraper, %replaced, "Scraper registered");
            }
            RunEvent::Admitted { run_id, scraper } => {
                tracing::info!(%run_id, %scraper, "Run admitted");
            }
            RunEvent::Queued { run_id, scraper } => {
                tracing::info!(%run_id, %scraper, "Run queued");
            }
            RunEvent::Rejected { scraper, reason } => {
                tracing::warn!(%scraper, %reason, "Run rejected");
            }
            RunEvent::Started { run_id, scraper } => {
                tracing::debug!(%run_id, %scraper, "Run started");
            }
            RunEvent::Succeeded { run_id, scraper } => {
                tracing::info!(%run_id, %scraper, "Run succeeded");
            }
            RunEvent::Failed {
                run_id,
                scraper,
                error,
            } => {
                tracing::warn!(%run_id, %scraper, kind = %error.kind, error = %error.message, "Run failed");
            }
            RunEvent::Cancelled { run_id, scraper } => {
                tracing::info!(%run_id, %scraper, "Run cancelled");
            }
            RunEvent::CancelRequested { run_id } => {
                tracing::info!(%run_id, "Cancellation requested");
            }
            RunEvent::Promoted { run_id, scraper } => {
                tracing::info!(%run_id, %scraper, "Queued run promoted");
            }
            RunEvent::Recovered {
                interrupted,
                promoted,
            } => {
                tracing::info!(%interrupted, %promoted, "Recovered run records");
            }
            RunEvent::ShuttingDown { in_flight } => {
                tracing::info!(%in_flight, "Orchestrator shutting down");
            }
            RunEvent::Stopped => {
                tracing::info!("Orchestrator stopped");
            }
        }
    }
}
