/// Smoke-test for `BrowserSessionProvider`.
///
/// Launches a headless Chromium, runs one scraper that renders
/// <https://example.com> in its own tab, and checks the extracted heading.
///
/// Run with:
///   cargo run -p kestrel-client --example browser_smoke --features browser
use std::time::Duration;

use kestrel_client::{BrowserSession, BrowserSessionProvider};
use kestrel_core::{
    FieldSpec, InMemoryRunStore, InputSchema, NewScraper, Orchestrator, OrchestratorConfig,
    RoutineError, RunContext, RunStatus,
};
use serde_json::{Value, json};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    println!("Launching headless browser…");
    let sessions = BrowserSessionProvider::launch().await?;
    let orchestrator = Orchestrator::new(InMemoryRunStore::new(), sessions, OrchestratorConfig::default());

    orchestrator.register(
        NewScraper::new("heading")
            .routine(|input: Value, ctx: RunContext| async move {
                let url = input["url"].as_str().unwrap_or_default().to_string();
                let session = ctx
                    .session
                    .downcast_ref::<BrowserSession>()
                    .ok_or_else(|| RoutineError::new("Session", "expected a browser session"))?;
                let html = session.render(&url).await?;
                Ok::<_, RoutineError>(json!({"url": url, "bytes": html.len(), "has_heading": html.contains("<h1>Example Domain</h1>")}))
            })
            .input_schema(InputSchema::new().field(FieldSpec::text("url").required())),
        false,
    )?;

    let run_id = orchestrator
        .submit("heading", json!({"url": "https://example.com"}))
        .await?;
    let record = tokio::time::timeout(
        Duration::from_secs(60),
        orchestrator.wait(run_id, Duration::from_millis(100)),
    )
    .await??;

    anyhow::ensure!(
        record.status == RunStatus::Succeeded,
        "run ended {}: {:?}",
        record.status,
        record.error
    );
    let result = record.result.unwrap_or_default();
    anyhow::ensure!(result["has_heading"] == json!(true), "expected <h1> not found");

    println!("OK: {result}");
    orchestrator.shutdown().await;
    Ok(())
}
