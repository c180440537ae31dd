pub mod config;
pub mod database;
pub mod run_repository;

pub use config::DatabaseConfig;
pub use database::Database;
pub use run_repository::PgRunStore;
