use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use kestrel_core::error::AppError;
use kestrel_core::routine::RoutineError;
use kestrel_core::run::{RunRecord, RunStatus};
use kestrel_core::store::RunStore;

/// PostgreSQL-backed [`RunStore`] over the `scraper_runs` table.
///
/// Admission decisions are still serialized in-process, so a single
/// orchestrator should own a given set of scrapers.
#[derive(Clone)]
pub struct PgRunStore {
    pool: Pool<Postgres>,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    scraper_name: String,
    input: serde_json::Value,
    status: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    result: Option<serde_json::Value>,
    error_kind: Option<String>,
    error_message: Option<String>,
}

impl TryFrom<RunRow> for RunRecord {
    type Error = AppError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        let status: RunStatus = row.status.parse().map_err(AppError::StoreError)?;
        let error = row
            .error_kind
            .map(|kind| RoutineError::new(kind, row.error_message.unwrap_or_default()));
        Ok(RunRecord {
            id: row.id,
            scraper_name: row.scraper_name,
            input: row.input,
            status,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            result: row.result,
            error,
        })
    }
}

fn db_error(e: sqlx::Error) -> AppError {
    AppError::StoreError(e.to_string())
}

fn into_records(rows: Vec<RunRow>) -> Result<Vec<RunRecord>, AppError> {
    rows.into_iter().map(RunRecord::try_from).collect()
}

impl RunStore for PgRunStore {
    async fn insert(&self, record: &RunRecord) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO scraper_runs
                (id, scraper_name, input, status, created_at, started_at, finished_at,
                 result, error_kind, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.id)
        .bind(&record.scraper_name)
        .bind(&record.input)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(&record.result)
        .bind(record.error.as_ref().map(|e| e.kind.as_str()))
        .bind(record.error.as_ref().map(|e| e.message.as_str()))
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(())
    }

    async fn update(&self, record: &RunRecord) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE scraper_runs
            SET status = $2, started_at = $3, finished_at = $4,
                result = $5, error_kind = $6, error_message = $7
            WHERE id = $1
            "#,
        )
        .bind(record.id)
        .bind(record.status.as_str())
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(&record.result)
        .bind(record.error.as_ref().map(|e| e.kind.as_str()))
        .bind(record.error.as_ref().map(|e| e.message.as_str()))
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(AppError::UnknownRun(record.id));
        }
        Ok(())
    }

    async fn get(&self, run_id: Uuid) -> Result<Option<RunRecord>, AppError> {
        let row = sqlx::query_as::<_, RunRow>("SELECT * FROM scraper_runs WHERE id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        row.map(RunRecord::try_from).transpose()
    }

    async fn count_by_status(&self, scraper_name: &str, status: RunStatus) -> Result<usize, AppError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM scraper_runs WHERE scraper_name = $1 AND status = $2",
        )
        .bind(scraper_name)
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(count as usize)
    }

    async fn oldest_queued(&self, scraper_name: &str) -> Result<Option<RunRecord>, AppError> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT * FROM scraper_runs
            WHERE scraper_name = $1 AND status = 'queued'
            ORDER BY created_at ASC, id ASC
            LIMIT 1
            "#,
        )
        .bind(scraper_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(RunRecord::try_from).transpose()
    }

    async fn list_by_scraper(&self, scraper_name: &str) -> Result<Vec<RunRecord>, AppError> {
        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT * FROM scraper_runs
            WHERE scraper_name = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(scraper_name)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        into_records(rows)
    }

    async fn list_by_status(&self, status: RunStatus) -> Result<Vec<RunRecord>, AppError> {
        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT * FROM scraper_runs
            WHERE status = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        into_records(rows)
    }

    async fn list_recent(
        &self,
        scraper_name: &str,
        status: Option<RunStatus>,
        limit: usize,
    ) -> Result<Vec<RunRecord>, AppError> {
        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT * FROM scraper_runs
            WHERE scraper_name = $1 AND ($2::VARCHAR IS NULL OR status = $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3
            "#,
        )
        .bind(scraper_name)
        .bind(status.map(|s| s.as_str()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        into_records(rows)
    }
}
