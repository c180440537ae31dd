//! Per-scraper admission: start a run now, queue it, or reject it, and
//! promote queued runs as running ones finish.
//!
//! Every decision for a scraper happens inside that scraper's critical
//! section, and the counts it reads come from the run store. Finished runs
//! are written back through [`AdmissionController::complete`] inside the same
//! section, so a submission never observes a freed slot before the queue
//! behind it has been served.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AppError;
use crate::executor::kinds;
use crate::registry::{ScraperDefinition, ScraperRegistry};
use crate::routine::RoutineError;
use crate::run::{RunRecord, RunStatus};
use crate::store::RunStore;

/// Attempts made for each run state write before it is deferred.
const WRITE_ATTEMPTS: u32 = 3;
const WRITE_BACKOFF: Duration = Duration::from_millis(20);

/// Live admission state of one scraper.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AdmissionCounters {
    pub running: usize,
    pub queued: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    StartNow,
    Enqueue,
    Reject,
}

/// Admission rule: start while below the concurrency limit and nothing is
/// waiting, else queue while below the queue limit, else reject.
///
/// A non-empty queue always takes the new run, so older runs keep their
/// place even when a slot is free.
pub fn decide(definition: &ScraperDefinition, counters: AdmissionCounters) -> Decision {
    if counters.queued == 0 && counters.running < definition.max_concurrent_runs() {
        Decision::StartNow
    } else if counters.queued < definition.max_queued_runs() {
        Decision::Enqueue
    } else {
        Decision::Reject
    }
}

/// A run that was moved to `running` and must now be handed to the executor.
#[derive(Debug)]
pub struct Dispatch {
    pub record: RunRecord,
    pub definition: Arc<ScraperDefinition>,
    pub cancel: CancellationToken,
}

#[derive(Debug)]
pub enum Admission {
    Started(Dispatch),
    /// The run joined the queue. `promoted` holds queued runs (possibly this
    /// one) that were started because slots were free behind the backlog.
    Queued {
        record: RunRecord,
        promoted: Vec<Dispatch>,
    },
}

impl Admission {
    pub fn run_id(&self) -> Uuid {
        match self {
            Admission::Started(dispatch) => dispatch.record.id,
            Admission::Queued { record, .. } => record.id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The run was queued and is now `cancelled`.
    Cancelled,
    /// The run is running; its routine was signalled and the executor
    /// decides the final status.
    CancellationRequested,
}

pub struct AdmissionController<S: RunStore> {
    registry: Arc<ScraperRegistry>,
    store: S,
    sections: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    tokens: Mutex<HashMap<Uuid, CancellationToken>>,
    /// State changes the store refused, replayed on the next visit to the
    /// scraper's section.
    deferred: Mutex<HashMap<Uuid, RunRecord>>,
    closed: AtomicBool,
}

impl<S: RunStore> AdmissionController<S> {
    pub fn new(registry: Arc<ScraperRegistry>, store: S) -> Self {
        Self {
            registry,
            store,
            sections: Mutex::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
            deferred: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn lock_sections(&self) -> MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        self.sections.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned admission mutex");
            poisoned.into_inner()
        })
    }

    fn lock_tokens(&self) -> MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        self.tokens.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned admission mutex");
            poisoned.into_inner()
        })
    }

    fn lock_deferred(&self) -> MutexGuard<'_, HashMap<Uuid, RunRecord>> {
        self.deferred.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned admission mutex");
            poisoned.into_inner()
        })
    }

    /// The async lock serializing admission decisions for one scraper.
    fn section(&self, scraper_name: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.lock_sections()
                .entry(scraper_name.to_string())
                .or_default(),
        )
    }

    pub async fn counters(&self, scraper_name: &str) -> Result<AdmissionCounters, AppError> {
        self.registry.lookup(scraper_name)?;
        self.read_counters(scraper_name).await
    }

    async fn read_counters(&self, scraper_name: &str) -> Result<AdmissionCounters, AppError> {
        Ok(AdmissionCounters {
            running: self
                .store
                .count_by_status(scraper_name, RunStatus::Running)
                .await?,
            queued: self
                .store
                .count_by_status(scraper_name, RunStatus::Queued)
                .await?,
        })
    }

    /// Write a record, retrying transient store errors with a linear backoff.
    async fn write(&self, record: &RunRecord) -> Result<(), AppError> {
        let mut attempt = 1;
        loop {
            match self.store.update(record).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < WRITE_ATTEMPTS && e.is_retryable() => {
                    tracing::warn!(run_id = %record.id, attempt, error = %e, "Retrying run write");
                    tokio::time::sleep(WRITE_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Write a record, or keep it for the next visit to its section when the
    /// store keeps refusing. Caller holds the scraper's section.
    async fn write_or_defer(&self, record: &RunRecord) {
        if let Err(e) = self.write(record).await {
            tracing::error!(
                run_id = %record.id,
                scraper = %record.scraper_name,
                status = %record.status,
                error = %e,
                "Failed to persist run state; deferring"
            );
            self.lock_deferred().insert(record.id, record.clone());
        }
    }

    /// Replay deferred writes of one scraper. Caller holds the section.
    async fn flush_deferred(&self, scraper_name: &str) {
        let pending: Vec<RunRecord> = self
            .lock_deferred()
            .values()
            .filter(|record| record.scraper_name == scraper_name)
            .cloned()
            .collect();

        for record in pending {
            match self.store.update(&record).await {
                Ok(()) => {
                    self.lock_deferred().remove(&record.id);
                    tracing::info!(run_id = %record.id, status = %record.status, "Deferred run state persisted");
                }
                Err(e) => {
                    tracing::warn!(run_id = %record.id, error = %e, "Deferred run state still not persisted");
                }
            }
        }
    }

    fn deferred_record(&self, run_id: Uuid) -> Option<RunRecord> {
        self.lock_deferred().get(&run_id).cloned()
    }

    /// Validate `raw` and admit a new run for `scraper_name`.
    ///
    /// Nothing is recorded when lookup, validation or capacity fails.
    pub async fn submit(&self, scraper_name: &str, raw: &Value) -> Result<Admission, AppError> {
        if self.is_closed() {
            return Err(AppError::ShuttingDown);
        }
        let definition = self.registry.lookup(scraper_name)?;
        let input = definition.input_schema().validate(raw)?;

        let section = self.section(scraper_name);
        let _guard = section.lock().await;
        // Shutdown may have signalled every token while we waited.
        if self.is_closed() {
            return Err(AppError::ShuttingDown);
        }
        self.flush_deferred(scraper_name).await;

        let counters = self.read_counters(scraper_name).await?;
        match decide(&definition, counters) {
            Decision::Reject => Err(AppError::CapacityExceeded {
                scraper: scraper_name.to_string(),
                max_concurrent: definition.max_concurrent_runs(),
                max_queued: definition.max_queued_runs(),
            }),
            Decision::Enqueue => {
                let record = RunRecord::queued(scraper_name, input);
                self.store.insert(&record).await?;
                let promoted = self.promote_locked(scraper_name, &definition).await;
                Ok(Admission::Queued { record, promoted })
            }
            Decision::StartNow => {
                let record = RunRecord::queued(scraper_name, input);
                self.store.insert(&record).await?;
                match self.begin(record.clone(), definition).await {
                    Ok(dispatch) => Ok(Admission::Started(dispatch)),
                    Err(e) => {
                        self.abandon(record, &e).await;
                        Err(e)
                    }
                }
            }
        }
    }

    /// Cancel a freshly inserted record that could not be started, so it
    /// does not wait in the queue for a caller that was told it failed.
    async fn abandon(&self, mut record: RunRecord, cause: &AppError) {
        tracing::warn!(run_id = %record.id, error = %cause, "Failed to start admitted run; cancelling it");
        if record.cancel().is_ok() {
            self.write_or_defer(&record).await;
        }
    }

    /// Move a queued record to `running`. Caller holds the scraper's section.
    async fn begin(
        &self,
        mut record: RunRecord,
        definition: Arc<ScraperDefinition>,
    ) -> Result<Dispatch, AppError> {
        record.start()?;
        // Registered before the store flips to `running` so recovery never
        // mistakes a starting run for an orphan.
        let cancel = CancellationToken::new();
        self.lock_tokens().insert(record.id, cancel.clone());
        if let Err(e) = self.write(&record).await {
            self.lock_tokens().remove(&record.id);
            return Err(e);
        }
        Ok(Dispatch {
            record,
            definition,
            cancel,
        })
    }

    /// Start queued runs in FIFO order while the scraper has free slots.
    ///
    /// Store failures end the pass early; runs already moved to `running`
    /// are still returned so they get executed.
    pub async fn promote(&self, scraper_name: &str) -> Vec<Dispatch> {
        if self.is_closed() {
            return Vec::new();
        }
        let definition = match self.registry.lookup(scraper_name) {
            Ok(definition) => definition,
            Err(e) => {
                tracing::debug!(scraper = %scraper_name, error = %e, "Skipping promotion");
                return Vec::new();
            }
        };

        let section = self.section(scraper_name);
        let _guard = section.lock().await;
        self.flush_deferred(scraper_name).await;
        self.promote_locked(scraper_name, &definition).await
    }

    /// Promotion pass. Caller holds the scraper's section.
    async fn promote_locked(
        &self,
        scraper_name: &str,
        definition: &Arc<ScraperDefinition>,
    ) -> Vec<Dispatch> {
        let mut started = Vec::new();
        loop {
            match self.promote_next(scraper_name, definition).await {
                Ok(Some(dispatch)) => started.push(dispatch),
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(scraper = %scraper_name, error = %e, "Failed to promote queued run");
                    break;
                }
            }
        }
        started
    }

    async fn promote_next(
        &self,
        scraper_name: &str,
        definition: &Arc<ScraperDefinition>,
    ) -> Result<Option<Dispatch>, AppError> {
        let running = self
            .store
            .count_by_status(scraper_name, RunStatus::Running)
            .await?;
        if running >= definition.max_concurrent_runs() {
            return Ok(None);
        }
        match self.store.oldest_queued(scraper_name).await? {
            Some(next) => self.begin(next, Arc::clone(definition)).await.map(Some),
            None => Ok(None),
        }
    }

    /// Persist a finished run, release its slot and promote its successors,
    /// all inside the scraper's section.
    ///
    /// A write the store keeps refusing is deferred and replayed on the next
    /// visit to the section; until then the slot stays taken.
    pub async fn complete(&self, record: &RunRecord) -> Vec<Dispatch> {
        let section = self.section(&record.scraper_name);
        let _guard = section.lock().await;

        self.flush_deferred(&record.scraper_name).await;
        self.write_or_defer(record).await;
        self.lock_tokens().remove(&record.id);

        if self.is_closed() {
            return Vec::new();
        }
        match self.registry.lookup(&record.scraper_name) {
            Ok(definition) => self.promote_locked(&record.scraper_name, &definition).await,
            Err(e) => {
                tracing::debug!(scraper = %record.scraper_name, error = %e, "Skipping promotion");
                Vec::new()
            }
        }
    }

    /// Cancel a queued run, or signal a running one.
    pub async fn cancel(&self, run_id: Uuid) -> Result<CancelOutcome, AppError> {
        let scraper_name = match self.deferred_record(run_id) {
            Some(record) => record.scraper_name,
            None => {
                self.store
                    .get(run_id)
                    .await?
                    .ok_or(AppError::UnknownRun(run_id))?
                    .scraper_name
            }
        };

        let section = self.section(&scraper_name);
        let _guard = section.lock().await;
        self.flush_deferred(&scraper_name).await;

        let mut record = match self.deferred_record(run_id) {
            Some(record) => record,
            None => self
                .store
                .get(run_id)
                .await?
                .ok_or(AppError::UnknownRun(run_id))?,
        };

        match record.status {
            RunStatus::Queued => {
                record.cancel()?;
                self.write(&record).await?;
                Ok(CancelOutcome::Cancelled)
            }
            RunStatus::Running => {
                match self.lock_tokens().get(&run_id) {
                    Some(token) => token.cancel(),
                    None => {
                        tracing::warn!(%run_id, "Running run has no local executor; cancellation not delivered");
                    }
                }
                Ok(CancelOutcome::CancellationRequested)
            }
            status => Err(AppError::AlreadyTerminal { run_id, status }),
        }
    }

    /// Fail every `running` record that no executor in this process owns.
    ///
    /// Such records were left behind by a previous process. Returns how many
    /// were marked `failed` with kind `Interrupted`.
    pub async fn recover_interrupted(&self) -> Result<usize, AppError> {
        let mut interrupted = 0;
        for candidate in self.store.list_by_status(RunStatus::Running).await? {
            if self.is_in_flight(candidate.id) {
                continue;
            }
            let section = self.section(&candidate.scraper_name);
            let _guard = section.lock().await;
            self.flush_deferred(&candidate.scraper_name).await;

            if self.is_in_flight(candidate.id) || self.deferred_record(candidate.id).is_some() {
                continue;
            }
            let Some(mut record) = self.store.get(candidate.id).await? else {
                continue;
            };
            if record.status != RunStatus::Running {
                continue;
            }
            record.fail(RoutineError::new(
                kinds::INTERRUPTED,
                "run was interrupted before it finished",
            ))?;
            self.write(&record).await?;
            tracing::warn!(run_id = %record.id, scraper = %record.scraper_name, "Marked orphaned run as interrupted");
            interrupted += 1;
        }
        Ok(interrupted)
    }

    /// Whether this process is executing the run.
    pub fn is_in_flight(&self, run_id: Uuid) -> bool {
        self.lock_tokens().contains_key(&run_id)
    }

    /// Stop admitting and promoting runs.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Signal every in-flight run. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let tokens = self.lock_tokens();
        for token in tokens.values() {
            token.cancel();
        }
        tokens.len()
    }
}
