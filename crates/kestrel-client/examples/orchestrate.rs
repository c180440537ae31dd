/// Submits a handful of runs against a JSON endpoint and prints the
/// resulting page of results.
///
/// Run with:
///   cargo run -p kestrel-client --example orchestrate
///
/// Honours `KESTREL_DEFAULT_PAGE_SIZE`, `KESTREL_MAX_PAGE_SIZE` and
/// `RUST_LOG` (also read from a `.env` file).
use std::time::Duration;

use kestrel_client::{HttpSession, HttpSessionProvider};
use kestrel_core::{
    FieldSpec, Filter, InMemoryRunStore, InputSchema, NewScraper, Orchestrator,
    OrchestratorConfig, QuerySpec, RoutineError, RunContext, RunStatus, Sort, SortOrder, View,
};
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let orchestrator = Orchestrator::new(
        InMemoryRunStore::new(),
        HttpSessionProvider::new()?,
        OrchestratorConfig::from_env()?,
    );

    orchestrator.register(
        NewScraper::new("users")
            .routine(|input: Value, ctx: RunContext| async move {
                let id = input["id"].as_i64().unwrap_or_default();
                let session = ctx
                    .session
                    .downcast_ref::<HttpSession>()
                    .ok_or_else(|| RoutineError::new("Session", "expected an HTTP session"))?;
                ctx.checkpoint()?;
                let user = session
                    .get_json(&format!("https://jsonplaceholder.typicode.com/users/{id}"))
                    .await?;
                Ok::<_, RoutineError>(json!({"id": id, "name": user["name"], "city": user["address"]["city"]}))
            })
            .input_schema(InputSchema::new().field(FieldSpec::integer("id").required()))
            .filter(Filter::status("ok", RunStatus::Succeeded))
            .sort(Sort::by_result_field("by_name", "/name", SortOrder::Ascending))
            .default_sort("by_name")
            .view(View::result_only("data"))
            .max_concurrent_runs(2)
            .max_queued_runs(10),
        false,
    )?;

    let mut runs = Vec::new();
    for id in 1..=5 {
        runs.push(orchestrator.submit("users", json!({"id": id})).await?);
    }
    for run_id in runs {
        let record = orchestrator.wait(run_id, Duration::from_millis(100)).await?;
        println!("{run_id}: {}", record.status);
    }

    let page = orchestrator
        .query("users", &QuerySpec::new().filter("ok").view("data"))
        .await?;
    println!("{}", serde_json::to_string_pretty(&page)?);

    orchestrator.shutdown().await;
    Ok(())
}
