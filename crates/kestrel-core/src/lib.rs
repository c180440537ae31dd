pub mod admission;
pub mod config;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod query;
pub mod registry;
pub mod reporter;
pub mod routine;
pub mod run;
pub mod schema;
pub mod session;
pub mod store;

#[cfg(test)]
pub(crate) mod testutil;

pub use admission::{AdmissionCounters, CancelOutcome};
pub use config::OrchestratorConfig;
pub use error::AppError;
pub use orchestrator::{Orchestrator, RecoveryReport};
pub use query::{Filter, PageRequest, QuerySpec, ResultPage, Sort, SortOrder, View};
pub use registry::{NewScraper, ScraperDefinition, ScraperRegistry, ScraperSummary};
pub use reporter::{RunEvent, RunReporter, TracingRunReporter};
pub use routine::{Routine, RoutineError, RunContext};
pub use run::{RunRecord, RunStatus};
pub use schema::{FieldKind, FieldSpec, InputSchema};
pub use session::{NullSessionProvider, Session, SessionProvider};
pub use store::{InMemoryRunStore, RunStore};
