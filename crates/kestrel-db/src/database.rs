use kestrel_core::{AppError, Orchestrator, OrchestratorConfig, SessionProvider};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::DatabaseConfig;
use crate::run_repository::PgRunStore;

/// Owns the PostgreSQL pool behind a Kestrel deployment.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| AppError::StoreError(format!("Failed to connect to PostgreSQL: {e}")))?;

        tracing::info!(max_connections = config.max_connections, "Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Connect using `DATABASE_URL` / `DATABASE_MAX_CONNECTIONS` and bring the
    /// `scraper_runs` schema up to date.
    pub async fn connect_from_env() -> Result<Self, AppError> {
        let db = Self::connect(&DatabaseConfig::from_env()?).await?;
        db.migrate().await?;
        Ok(db)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::StoreError(format!("Applying run migrations failed: {e}")))
    }

    pub fn run_store(&self) -> PgRunStore {
        PgRunStore::new(self.pool.clone())
    }

    /// An orchestrator persisting its runs in this database.
    ///
    /// Register scrapers and call [`Orchestrator::recover`] before accepting
    /// submissions, so runs left over from a previous process are settled.
    pub fn orchestrator<P: SessionProvider>(
        &self,
        sessions: P,
        config: OrchestratorConfig,
    ) -> Orchestrator<PgRunStore, P> {
        Orchestrator::new(self.run_store(), sessions, config)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
