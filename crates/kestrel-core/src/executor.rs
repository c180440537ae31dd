use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::admission::{AdmissionController, Dispatch};
use crate::registry::ScraperDefinition;
use crate::reporter::{RunEvent, RunReporter};
use crate::routine::{RoutineError, RunContext};
use crate::run::{RunRecord, RunStatus};
use crate::session::{Session, SessionProvider};
use crate::store::RunStore;

/// Error kinds the executor records on runs it fails itself.
pub mod kinds {
    pub const SESSION_UNAVAILABLE: &str = "SessionUnavailable";
    pub const PANIC: &str = "Panic";
    pub const RESOURCE_RELEASE: &str = "ResourceRelease";
    pub const INTERRUPTED: &str = "Interrupted";
}

/// How a run ended, before it is written to its record.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Succeeded(Value),
    Failed(RoutineError),
    Cancelled,
}

/// A finished run and the queued runs its completion promoted.
#[derive(Debug)]
pub struct Completion {
    pub record: RunRecord,
    pub promoted: Vec<Dispatch>,
}

/// Drives one running record to a terminal state.
///
/// Acquires a session, invokes the routine with panics contained, releases
/// the session on every path and hands the finished record back to
/// admission, which persists it and frees the slot.
pub struct RunExecutor<S: RunStore, P: SessionProvider> {
    sessions: P,
    admission: Arc<AdmissionController<S>>,
    reporter: Arc<dyn RunReporter>,
}

impl<S: RunStore, P: SessionProvider> RunExecutor<S, P> {
    pub fn new(
        sessions: P,
        admission: Arc<AdmissionController<S>>,
        reporter: Arc<dyn RunReporter>,
    ) -> Self {
        Self {
            sessions,
            admission,
            reporter,
        }
    }

    /// Execute a dispatched run. Never fails: every problem ends up on the
    /// record as a `failed` status.
    pub async fn execute(&self, dispatch: Dispatch) -> Completion {
        let Dispatch {
            record,
            definition,
            cancel,
        } = dispatch;
        let run_id = record.id;
        let scraper_name = record.scraper_name.clone();

        self.reporter.report(RunEvent::Started {
            run_id,
            scraper: &scraper_name,
        });

        let outcome = if cancel.is_cancelled() {
            RunOutcome::Cancelled
        } else {
            AssertUnwindSafe(self.invoke(&definition, &record, cancel))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    RunOutcome::Failed(RoutineError::new(kinds::PANIC, panic_message(&*panic)))
                })
        };

        let record = apply_outcome(record, outcome);
        let promoted = self.admission.complete(&record).await;
        self.report_outcome(&record);
        Completion { record, promoted }
    }

    async fn invoke(
        &self,
        definition: &ScraperDefinition,
        record: &RunRecord,
        cancel: CancellationToken,
    ) -> RunOutcome {
        let session = match self.sessions.acquire(&record.scraper_name, record.id).await {
            Ok(session) => session,
            Err(e) => {
                return RunOutcome::Failed(RoutineError::new(
                    kinds::SESSION_UNAVAILABLE,
                    e.to_string(),
                ));
            }
        };

        let ctx = RunContext {
            run_id: record.id,
            scraper_name: record.scraper_name.clone(),
            cancel: cancel.clone(),
            session: session.clone(),
        };
        let routine = Arc::clone(definition.routine());
        let input = record.input.clone();
        let result = AssertUnwindSafe(async move { routine.run(input, ctx).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(RoutineError::new(kinds::PANIC, panic_message(&*panic))));

        if let Err(e) = self.release(session, record.id).await {
            return RunOutcome::Failed(e);
        }

        match result {
            Ok(value) => RunOutcome::Succeeded(value),
            Err(_) if cancel.is_cancelled() => RunOutcome::Cancelled,
            Err(e) => RunOutcome::Failed(e),
        }
    }

    async fn release(&self, session: Session, run_id: Uuid) -> Result<(), RoutineError> {
        self.sessions.release(session).await.map_err(|e| {
            tracing::error!(%run_id, error = %e, "Failed to release run session");
            RoutineError::new(kinds::RESOURCE_RELEASE, e.to_string())
        })
    }

    fn report_outcome(&self, record: &RunRecord) {
        let scraper = record.scraper_name.as_str();
        match (&record.status, &record.error) {
            (RunStatus::Succeeded, _) => self.reporter.report(RunEvent::Succeeded {
                run_id: record.id,
                scraper,
            }),
            (RunStatus::Failed, Some(error)) => self.reporter.report(RunEvent::Failed {
                run_id: record.id,
                scraper,
                error,
            }),
            (RunStatus::Cancelled, _) => self.reporter.report(RunEvent::Cancelled {
                run_id: record.id,
                scraper,
            }),
            _ => {}
        }
    }
}

fn apply_outcome(mut record: RunRecord, outcome: RunOutcome) -> RunRecord {
    let applied = match outcome {
        RunOutcome::Succeeded(value) => record.succeed(value),
        RunOutcome::Failed(error) => record.fail(error),
        RunOutcome::Cancelled => record.cancel(),
    };
    if let Err(e) = applied {
        tracing::error!(run_id = %record.id, error = %e, "Run outcome could not be applied");
    }
    record
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "routine panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::Admission;
    use crate::registry::{NewScraper, ScraperRegistry};
    use crate::routine::Routine;
    use crate::schema::{FieldSpec, InputSchema};
    use crate::store::{InMemoryRunStore, RunStore};
    use crate::testutil::{MockReporter, MockSessionProvider, echo_routine, panicking_routine};
    use serde_json::json;

    struct Harness {
        store: InMemoryRunStore,
        admission: Arc<AdmissionController<InMemoryRunStore>>,
        executor: RunExecutor<InMemoryRunStore, MockSessionProvider>,
        sessions: MockSessionProvider,
        reporter: MockReporter,
    }

    fn harness<R: Routine + 'static>(routine: R, sessions: MockSessionProvider) -> Harness {
        let registry = Arc::new(ScraperRegistry::new());
        registry
            .register(
                NewScraper::new("books")
                    .routine(routine)
                    .input_schema(
                        InputSchema::new()
                            .field(FieldSpec::text("q"))
                            .field(FieldSpec::integer("n")),
                    )
                    .max_queued_runs(5),
                false,
            )
            .unwrap();
        let store = InMemoryRunStore::new();
        let admission = Arc::new(AdmissionController::new(registry, store.clone()));
        let reporter = MockReporter::new();
        let executor = RunExecutor::new(
            sessions.clone(),
            Arc::clone(&admission),
            Arc::new(reporter.clone()),
        );
        Harness {
            store,
            admission,
            executor,
            sessions,
            reporter,
        }
    }

    async fn start(h: &Harness, input: Value) -> Dispatch {
        match h.admission.submit("books", &input).await.unwrap() {
            Admission::Started(dispatch) => dispatch,
            Admission::Queued { .. } => panic!("expected the run to start"),
        }
    }

    #[tokio::test]
    async fn success_stores_result_and_releases_session() {
        let h = harness(echo_routine(), MockSessionProvider::new());
        let dispatch = start(&h, json!({"q": "rust"})).await;

        let done = h.executor.execute(dispatch).await;

        assert_eq!(done.record.status, RunStatus::Succeeded);
        assert_eq!(done.record.result, Some(json!({"q": "rust"})));
        assert_eq!(h.store.get(done.record.id).await.unwrap(), Some(done.record.clone()));
        assert_eq!(h.sessions.acquired().len(), 1);
        assert_eq!(h.sessions.released().len(), 1);
        assert!(h.reporter.labels().contains(&"succeeded".to_string()));
    }

    #[tokio::test]
    async fn routine_error_is_recorded_verbatim() {
        let routine = |_input: Value, _ctx: RunContext| async move {
            Err::<Value, _>(RoutineError::new("Http", "HTTP 503 for https://example.com"))
        };
        let h = harness(routine, MockSessionProvider::new());
        let dispatch = start(&h, json!({})).await;

        let done = h.executor.execute(dispatch).await;

        assert_eq!(done.record.status, RunStatus::Failed);
        assert_eq!(
            done.record.error,
            Some(RoutineError::new("Http", "HTTP 503 for https://example.com"))
        );
        assert!(done.record.result.is_none());
        assert_eq!(h.sessions.released().len(), 1);
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let h = harness(panicking_routine("selector not found"), MockSessionProvider::new());
        let dispatch = start(&h, json!({})).await;

        let done = h.executor.execute(dispatch).await;

        let error = done.record.error.unwrap();
        assert_eq!(done.record.status, RunStatus::Failed);
        assert_eq!(error.kind, kinds::PANIC);
        assert!(error.message.contains("selector not found"));
        assert_eq!(h.sessions.released().len(), 1);
    }

    #[tokio::test]
    async fn acquire_failure_skips_routine() {
        let h = harness(
            panicking_routine("must not run"),
            MockSessionProvider::new().failing_acquire(),
        );
        let dispatch = start(&h, json!({})).await;

        let done = h.executor.execute(dispatch).await;

        assert_eq!(done.record.status, RunStatus::Failed);
        assert_eq!(done.record.error.unwrap().kind, kinds::SESSION_UNAVAILABLE);
        assert!(h.sessions.released().is_empty());
    }

    #[tokio::test]
    async fn release_failure_fails_an_otherwise_successful_run() {
        let h = harness(echo_routine(), MockSessionProvider::new().failing_release());
        let dispatch = start(&h, json!({})).await;

        let done = h.executor.execute(dispatch).await;

        assert_eq!(done.record.status, RunStatus::Failed);
        assert_eq!(done.record.error.unwrap().kind, kinds::RESOURCE_RELEASE);
        assert!(done.record.result.is_none());
    }

    #[tokio::test]
    async fn cancelled_before_start_never_invokes_routine() {
        let h = harness(panicking_routine("must not run"), MockSessionProvider::new());
        let dispatch = start(&h, json!({})).await;
        dispatch.cancel.cancel();

        let done = h.executor.execute(dispatch).await;

        assert_eq!(done.record.status, RunStatus::Cancelled);
        assert!(done.record.error.is_none());
        assert!(h.sessions.acquired().is_empty());
    }

    #[tokio::test]
    async fn completion_promotes_next_queued_run() {
        let h = harness(echo_routine(), MockSessionProvider::new());
        let dispatch = start(&h, json!({"n": 1})).await;
        let queued = h.admission.submit("books", &json!({"n": 2})).await.unwrap();
        assert!(matches!(queued, Admission::Queued { .. }));

        let done = h.executor.execute(dispatch).await;

        assert_eq!(done.promoted.len(), 1);
        assert_eq!(done.promoted[0].record.id, queued.run_id());
        assert_eq!(done.promoted[0].record.status, RunStatus::Running);
    }

    #[test]
    fn panic_messages() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(&*boxed), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*boxed), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(42);
        assert_eq!(panic_message(&*boxed), "routine panicked");
    }
}
