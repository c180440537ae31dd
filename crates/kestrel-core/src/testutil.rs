//! Test utilities: handwritten mocks and routines for unit tests.
//!
//! Mocks use `Arc<Mutex<_>>` for interior mutability so tests can assert on
//! recorded calls.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use serde_json::Value;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::error::AppError;
use crate::reporter::{RunEvent, RunReporter};
use crate::routine::{Routine, RoutineError, RoutineFuture, RunContext};
use crate::run::{RunRecord, RunStatus};
use crate::session::{Session, SessionProvider};
use crate::store::{InMemoryRunStore, RunStore};

// ---------------------------------------------------------------------------
// Routines
// ---------------------------------------------------------------------------

/// Routine returning its input as the result.
pub fn echo_routine() -> impl Routine + Clone {
    |input: Value, _ctx: RunContext| async move { Ok::<_, RoutineError>(input) }
}

/// Routine that panics with `message` when invoked.
pub fn panicking_routine(message: &'static str) -> impl Routine {
    PanickingRoutine(message)
}

struct PanickingRoutine(&'static str);

async fn explode(message: &'static str) -> Result<Value, RoutineError> {
    panic!("{message}")
}

impl Routine for PanickingRoutine {
    fn run(&self, _input: Value, _ctx: RunContext) -> RoutineFuture {
        Box::pin(explode(self.0))
    }
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

/// Holds routine invocations until the test opens the gate.
///
/// Records the order in which inputs started and the highest number of
/// invocations that were inside the routine at once.
#[derive(Clone)]
pub struct Gate {
    permits: Arc<Semaphore>,
    started: Arc<Mutex<Vec<Value>>>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl Gate {
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(0)),
            started: Arc::new(Mutex::new(Vec::new())),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Let `n` waiting (or future) invocations finish.
    pub fn open(&self, n: usize) {
        self.permits.add_permits(n);
    }

    pub fn started(&self) -> Vec<Value> {
        self.started.lock().unwrap().clone()
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn enter(&self, input: &Value) {
        self.started.lock().unwrap().push(input.clone());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    async fn pass(&self) {
        if let Ok(permit) = self.permits.acquire().await {
            permit.forget();
        }
    }

    /// Waits for the gate; stops early with a cancellation error when the
    /// run is cancelled.
    pub fn routine(&self) -> impl Routine + Clone + use<> {
        let gate = self.clone();
        move |input: Value, ctx: RunContext| {
            let gate = gate.clone();
            async move {
                gate.enter(&input);
                let result = tokio::select! {
                    _ = gate.pass() => Ok(input),
                    _ = ctx.cancel.cancelled() => Err(RoutineError::cancelled()),
                };
                gate.leave();
                result
            }
        }
    }

    /// Waits for the gate regardless of cancellation.
    pub fn stubborn_routine(&self) -> impl Routine + Clone + use<> {
        let gate = self.clone();
        move |input: Value, _ctx: RunContext| {
            let gate = gate.clone();
            async move {
                gate.enter(&input);
                gate.pass().await;
                gate.leave();
                Ok::<_, RoutineError>(input)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MockSessionProvider
// ---------------------------------------------------------------------------

/// Session provider that records acquire/release calls.
#[derive(Clone, Default)]
pub struct MockSessionProvider {
    acquired: Arc<Mutex<Vec<Uuid>>>,
    released: Arc<Mutex<Vec<Uuid>>>,
    fail_acquire: bool,
    fail_release: bool,
}

impl MockSessionProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_acquire(mut self) -> Self {
        self.fail_acquire = true;
        self
    }

    pub fn failing_release(mut self) -> Self {
        self.fail_release = true;
        self
    }

    pub fn acquired(&self) -> Vec<Uuid> {
        self.acquired.lock().unwrap().clone()
    }

    pub fn released(&self) -> Vec<Uuid> {
        self.released.lock().unwrap().clone()
    }
}

impl SessionProvider for MockSessionProvider {
    async fn acquire(&self, _scraper_name: &str, run_id: Uuid) -> Result<Session, AppError> {
        if self.fail_acquire {
            return Err(AppError::SessionError("browser did not start".into()));
        }
        self.acquired.lock().unwrap().push(run_id);
        Ok(Session::new(run_id))
    }

    async fn release(&self, session: Session) -> Result<(), AppError> {
        let run_id = session
            .downcast_ref::<Uuid>()
            .copied()
            .ok_or_else(|| AppError::ResourceRelease("foreign session".into()))?;
        self.released.lock().unwrap().push(run_id);
        if self.fail_release {
            return Err(AppError::ResourceRelease("tab did not close".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FlakyStore
// ---------------------------------------------------------------------------

/// In-memory store whose next `n` updates fail, for exercising write errors.
#[derive(Clone, Default)]
pub struct FlakyStore {
    inner: InMemoryRunStore,
    failing_updates: Arc<AtomicUsize>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_updates(&self, n: usize) {
        self.failing_updates.store(n, Ordering::SeqCst);
    }
}

impl RunStore for FlakyStore {
    async fn insert(&self, record: &RunRecord) -> Result<(), AppError> {
        self.inner.insert(record).await
    }

    async fn update(&self, record: &RunRecord) -> Result<(), AppError> {
        let failing = self
            .failing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AppError::StoreError("connection reset".into()));
        }
        self.inner.update(record).await
    }

    async fn get(&self, run_id: Uuid) -> Result<Option<RunRecord>, AppError> {
        self.inner.get(run_id).await
    }

    async fn count_by_status(&self, scraper_name: &str, status: RunStatus) -> Result<usize, AppError> {
        self.inner.count_by_status(scraper_name, status).await
    }

    async fn oldest_queued(&self, scraper_name: &str) -> Result<Option<RunRecord>, AppError> {
        self.inner.oldest_queued(scraper_name).await
    }

    async fn list_by_scraper(&self, scraper_name: &str) -> Result<Vec<RunRecord>, AppError> {
        self.inner.list_by_scraper(scraper_name).await
    }

    async fn list_by_status(&self, status: RunStatus) -> Result<Vec<RunRecord>, AppError> {
        self.inner.list_by_status(status).await
    }

    async fn list_recent(
        &self,
        scraper_name: &str,
        status: Option<RunStatus>,
        limit: usize,
    ) -> Result<Vec<RunRecord>, AppError> {
        self.inner.list_recent(scraper_name, status, limit).await
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Reporter that records a label per event.
#[derive(Clone, Default)]
pub struct MockReporter {
    labels: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn labels(&self) -> Vec<String> {
        self.labels.lock().unwrap().clone()
    }
}

impl RunReporter for MockReporter {
    fn report(&self, event: RunEvent<'_>) {
        let label = match event {
            RunEvent::Registered { .. } => "registered",
            RunEvent::Admitted { .. } => "admitted",
            RunEvent::Queued { .. } => "queued",
            RunEvent::Rejected { .. } => "rejected",
            RunEvent::Started { .. } => "started",
            RunEvent::Succeeded { .. } => "succeeded",
            RunEvent::Failed { .. } => "failed",
            RunEvent::Cancelled { .. } => "cancelled",
            RunEvent::CancelRequested { .. } => "cancel_requested",
            RunEvent::Promoted { .. } => "promoted",
            RunEvent::Recovered { .. } => "recovered",
            RunEvent::ShuttingDown { .. } => "shutting_down",
            RunEvent::Stopped => "stopped",
        };
        self.labels.lock().unwrap().push(label.to_string());
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// A finished record created `offset_secs` after now.
pub fn finished_record(
    scraper: &str,
    offset_secs: i64,
    outcome: Result<Value, RoutineError>,
) -> RunRecord {
    let mut record = RunRecord::queued(scraper, serde_json::json!({}));
    record.created_at += ChronoDuration::seconds(offset_secs);
    record.start().unwrap();
    match outcome {
        Ok(value) => record.succeed(value).unwrap(),
        Err(error) => record.fail(error).unwrap(),
    }
    record
}

/// Poll `store` until the run reaches `status`. Panics after five seconds.
pub async fn wait_for_status<S: RunStore>(store: &S, run_id: Uuid, status: RunStatus) -> RunRecord {
    let poll = async {
        loop {
            if let Some(record) = store.get(run_id).await.unwrap()
                && record.status == status
            {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), poll)
        .await
        .unwrap_or_else(|_| panic!("run {run_id} never reached {status}"))
}

/// Poll `condition` until it holds. Panics after five seconds.
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), poll)
        .await
        .unwrap_or_else(|_| panic!("condition never held"));
}
