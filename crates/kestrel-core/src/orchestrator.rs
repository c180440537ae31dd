use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::admission::{Admission, AdmissionController, AdmissionCounters, CancelOutcome, Dispatch};
use crate::config::OrchestratorConfig;
use crate::error::AppError;
use crate::executor::RunExecutor;
use crate::query::{QuerySpec, ResultPage, ResultQuery};
use crate::registry::{NewScraper, ScraperDefinition, ScraperRegistry, ScraperSummary};
use crate::reporter::{RunEvent, RunReporter, TracingRunReporter};
use crate::run::{RunRecord, RunStatus};
use crate::session::SessionProvider;
use crate::store::RunStore;

/// What [`Orchestrator::recover`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Orphaned `running` records marked `failed`.
    pub interrupted: usize,
    /// Queued records started afterwards.
    pub promoted: usize,
}

struct Shared<S: RunStore, P: SessionProvider> {
    registry: Arc<ScraperRegistry>,
    store: S,
    admission: Arc<AdmissionController<S>>,
    executor: RunExecutor<S, P>,
    query: ResultQuery<S>,
    reporter: Arc<dyn RunReporter>,
    tracker: TaskTracker,
}

/// Entry point tying the registry, admission, execution and queries together.
///
/// Cheap to clone; clones share the same state.
pub struct Orchestrator<S: RunStore, P: SessionProvider> {
    shared: Arc<Shared<S, P>>,
}

impl<S: RunStore, P: SessionProvider> Clone for Orchestrator<S, P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: RunStore, P: SessionProvider> Orchestrator<S, P> {
    pub fn new(store: S, sessions: P, config: OrchestratorConfig) -> Self {
        Self::with_reporter(store, sessions, config, Arc::new(TracingRunReporter))
    }

    pub fn with_reporter(
        store: S,
        sessions: P,
        config: OrchestratorConfig,
        reporter: Arc<dyn RunReporter>,
    ) -> Self {
        let registry = Arc::new(ScraperRegistry::new());
        let admission = Arc::new(AdmissionController::new(
            Arc::clone(&registry),
            store.clone(),
        ));
        let executor = RunExecutor::new(
            sessions,
            Arc::clone(&admission),
            Arc::clone(&reporter),
        );
        let query = ResultQuery::new(Arc::clone(&registry), store.clone(), &config);
        Self {
            shared: Arc::new(Shared {
                registry,
                store,
                admission,
                executor,
                query,
                reporter,
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn registry(&self) -> &ScraperRegistry {
        &self.shared.registry
    }

    /// Register a scraper. See [`ScraperRegistry::register`].
    pub fn register(
        &self,
        new: NewScraper,
        overwrite: bool,
    ) -> Result<Arc<ScraperDefinition>, AppError> {
        let replaced = self.shared.registry.lookup(&new.name).is_ok();
        let definition = self.shared.registry.register(new, overwrite)?;
        self.shared.reporter.report(RunEvent::Registered {
            scraper: definition.name(),
            replaced,
        });
        if replaced {
            self.promote_in_background(definition.name());
        }
        Ok(definition)
    }

    /// A replacement may have raised the concurrency limit, which frees
    /// slots for queued runs without any run completing.
    fn promote_in_background(&self, scraper_name: &str) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(scraper = %scraper_name, "No runtime; queued runs wait for the next completion");
            return;
        };
        let shared = Arc::clone(&self.shared);
        let scraper_name = scraper_name.to_string();
        self.shared.tracker.spawn_on(
            async move {
                let started = shared.admission.promote(&scraper_name).await;
                Self::start_promoted(&shared, started);
            },
            &handle,
        );
    }

    pub fn scrapers(&self) -> Vec<ScraperSummary> {
        self.shared.registry.summaries()
    }

    /// Submit a run. Returns its id once it is recorded as `running` or
    /// `queued`; the outcome is observed through [`Orchestrator::get_run`].
    pub async fn submit(&self, scraper_name: &str, input: Value) -> Result<Uuid, AppError> {
        match self.shared.admission.submit(scraper_name, &input).await {
            Ok(Admission::Started(dispatch)) => {
                let run_id = dispatch.record.id;
                self.shared.reporter.report(RunEvent::Admitted {
                    run_id,
                    scraper: scraper_name,
                });
                Self::spawn(&self.shared, dispatch);
                Ok(run_id)
            }
            Ok(Admission::Queued { record, promoted }) => {
                self.shared.reporter.report(RunEvent::Queued {
                    run_id: record.id,
                    scraper: scraper_name,
                });
                Self::start_promoted(&self.shared, promoted);
                Ok(record.id)
            }
            Err(e) => {
                if matches!(e, AppError::CapacityExceeded { .. }) {
                    self.shared.reporter.report(RunEvent::Rejected {
                        scraper: scraper_name,
                        reason: &e.to_string(),
                    });
                }
                Err(e)
            }
        }
    }

    /// Hand a dispatch to the executor on a tracked task. The task starts
    /// whatever the completion promoted.
    fn spawn(shared: &Arc<Shared<S, P>>, dispatch: Dispatch) {
        let task_shared = Arc::clone(shared);
        shared.tracker.spawn(async move {
            let completion = task_shared.executor.execute(dispatch).await;
            Self::start_promoted(&task_shared, completion.promoted);
        });
    }

    fn start_promoted(shared: &Arc<Shared<S, P>>, promoted: Vec<Dispatch>) -> usize {
        let count = promoted.len();
        for next in promoted {
            shared.reporter.report(RunEvent::Promoted {
                run_id: next.record.id,
                scraper: &next.record.scraper_name,
            });
            Self::spawn(shared, next);
        }
        count
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<RunRecord, AppError> {
        self.shared
            .store
            .get(run_id)
            .await?
            .ok_or(AppError::UnknownRun(run_id))
    }

    /// Most recent runs of a scraper, optionally narrowed to one status.
    pub async fn list_runs(
        &self,
        scraper_name: &str,
        status: Option<RunStatus>,
        limit: usize,
    ) -> Result<Vec<RunRecord>, AppError> {
        self.shared.registry.lookup(scraper_name)?;
        self.shared
            .store
            .list_recent(scraper_name, status, limit)
            .await
    }

    pub async fn counters(&self, scraper_name: &str) -> Result<AdmissionCounters, AppError> {
        self.shared.admission.counters(scraper_name).await
    }

    pub async fn cancel(&self, run_id: Uuid) -> Result<CancelOutcome, AppError> {
        let outcome = self.shared.admission.cancel(run_id).await?;
        match outcome {
            CancelOutcome::Cancelled => {
                let record = self.get_run(run_id).await?;
                self.shared.reporter.report(RunEvent::Cancelled {
                    run_id,
                    scraper: &record.scraper_name,
                });
            }
            CancelOutcome::CancellationRequested => {
                self.shared
                    .reporter
                    .report(RunEvent::CancelRequested { run_id });
            }
        }
        Ok(outcome)
    }

    pub async fn query(&self, scraper_name: &str, spec: &QuerySpec) -> Result<ResultPage, AppError> {
        self.shared.query.query(scraper_name, spec).await
    }

    /// Poll until the run reaches a terminal status.
    pub async fn wait(&self, run_id: Uuid, poll_interval: Duration) -> Result<RunRecord, AppError> {
        loop {
            let record = self.get_run(run_id).await?;
            if record.status.is_terminal() {
                return Ok(record);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Reconcile the store after a restart: fail orphaned `running` records,
    /// then start queued runs up to each scraper's limit.
    ///
    /// Call after registering scrapers; queued runs of unregistered scrapers
    /// stay queued.
    pub async fn recover(&self) -> Result<RecoveryReport, AppError> {
        let interrupted = self.shared.admission.recover_interrupted().await?;
        let mut promoted = 0;
        for scraper_name in self.shared.registry.list() {
            let started = self.shared.admission.promote(&scraper_name).await;
            promoted += Self::start_promoted(&self.shared, started);
        }
        self.shared.reporter.report(RunEvent::Recovered {
            interrupted,
            promoted,
        });
        Ok(RecoveryReport {
            interrupted,
            promoted,
        })
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.admission.is_closed()
    }

    /// Stop admitting runs, signal every in-flight run and wait for the
    /// executors to finish. Queued runs stay queued for a later
    /// [`Orchestrator::recover`].
    pub async fn shutdown(&self) {
        self.shared.admission.close();
        let in_flight = self.shared.admission.cancel_all();
        self.shared
            .reporter
            .report(RunEvent::ShuttingDown { in_flight });

        self.shared.tracker.close();
        self.shared.tracker.wait().await;

        self.shared.reporter.report(RunEvent::Stopped);
    }
}
