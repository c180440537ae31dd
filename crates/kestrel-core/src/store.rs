use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

use crate::error::AppError;
use crate::run::{RunRecord, RunStatus};

/// Durable home of run records.
///
/// Admission decisions are derived from [`RunStore::count_by_status`] and
/// [`RunStore::oldest_queued`], so every write must be visible to the next read.
pub trait RunStore: Send + Sync + Clone + 'static {
    fn insert(&self, record: &RunRecord) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Overwrite an existing record. Fails with `UnknownRun` if it was never inserted.
    fn update(&self, record: &RunRecord) -> impl Future<Output = Result<(), AppError>> + Send;

    fn get(
        &self,
        run_id: Uuid,
    ) -> impl Future<Output = Result<Option<RunRecord>, AppError>> + Send;

    fn count_by_status(
        &self,
        scraper_name: &str,
        status: RunStatus,
    ) -> impl Future<Output = Result<usize, AppError>> + Send;

    /// The next queued record in FIFO order (`created_at`, then run id).
    fn oldest_queued(
        &self,
        scraper_name: &str,
    ) -> impl Future<Output = Result<Option<RunRecord>, AppError>> + Send;

    /// Every record of a scraper, in FIFO order.
    fn list_by_scraper(
        &self,
        scraper_name: &str,
    ) -> impl Future<Output = Result<Vec<RunRecord>, AppError>> + Send;

    /// Records with the given status across all scrapers, in FIFO order.
    fn list_by_status(
        &self,
        status: RunStatus,
    ) -> impl Future<Output = Result<Vec<RunRecord>, AppError>> + Send;

    /// Most recent records of a scraper first, optionally narrowed to one status.
    fn list_recent(
        &self,
        scraper_name: &str,
        status: Option<RunStatus>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<RunRecord>, AppError>> + Send;
}

/// Process-local [`RunStore`]. Records are lost when the process exits.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRunStore {
    records: Arc<Mutex<HashMap<Uuid, RunRecord>>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_records(&self) -> MutexGuard<'_, HashMap<Uuid, RunRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned run store mutex");
            poisoned.into_inner()
        })
    }

    fn select<F>(&self, predicate: F) -> Vec<RunRecord>
    where
        F: Fn(&RunRecord) -> bool,
    {
        let mut records: Vec<RunRecord> = self
            .lock_records()
            .values()
            .filter(|r| predicate(r))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.fifo_cmp(b));
        records
    }
}

impl RunStore for InMemoryRunStore {
    async fn insert(&self, record: &RunRecord) -> Result<(), AppError> {
        let mut records = self.lock_records();
        if records.contains_key(&record.id) {
            return Err(AppError::StoreError(format!(
                "run {} already exists",
                record.id
            )));
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn update(&self, record: &RunRecord) -> Result<(), AppError> {
        match self.lock_records().get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(AppError::UnknownRun(record.id)),
        }
    }

    async fn get(&self, run_id: Uuid) -> Result<Option<RunRecord>, AppError> {
        Ok(self.lock_records().get(&run_id).cloned())
    }

    async fn count_by_status(&self, scraper_name: &str, status: RunStatus) -> Result<usize, AppError> {
        Ok(self
            .lock_records()
            .values()
            .filter(|r| r.scraper_name == scraper_name && r.status == status)
            .count())
    }

    async fn oldest_queued(&self, scraper_name: &str) -> Result<Option<RunRecord>, AppError> {
        Ok(self
            .lock_records()
            .values()
            .filter(|r| r.scraper_name == scraper_name && r.status == RunStatus::Queued)
            .min_by(|a, b| a.fifo_cmp(b))
            .cloned())
    }

    async fn list_by_scraper(&self, scraper_name: &str) -> Result<Vec<RunRecord>, AppError> {
        Ok(self.select(|r| r.scraper_name == scraper_name))
    }

    async fn list_by_status(&self, status: RunStatus) -> Result<Vec<RunRecord>, AppError> {
        Ok(self.select(|r| r.status == status))
    }

    async fn list_recent(
        &self,
        scraper_name: &str,
        status: Option<RunStatus>,
        limit: usize,
    ) -> Result<Vec<RunRecord>, AppError> {
        let mut records =
            self.select(|r| r.scraper_name == scraper_name && status.is_none_or(|s| r.status == s));
        records.reverse();
        records.truncate(limit);
        Ok(records)
    }
}
