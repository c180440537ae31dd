use std::time::Duration;

use kestrel_core::{
    AppError, FieldSpec, InputSchema, NewScraper, NullSessionProvider, Orchestrator,
    OrchestratorConfig, QuerySpec, RoutineError, RunContext, RunRecord, RunStatus, RunStore, Sort,
    View,
};
use kestrel_db::{Database, PgRunStore};
use serde_json::{Value, json};

use crate::integration::common::setup_test_db;

fn scraper() -> NewScraper {
    NewScraper::new("books")
        .routine(|input: Value, _ctx: RunContext| async move {
            Ok::<_, RoutineError>(json!({"title": input["title"]}))
        })
        .input_schema(InputSchema::new().field(FieldSpec::text("title").required()))
        .sort(Sort::oldest_first())
        .view(View::result_only("data"))
        .max_concurrent_runs(2)
        .max_queued_runs(10)
}

#[tokio::test]
async fn runs_are_persisted_through_the_orchestrator() {
    let (pool, _container) = setup_test_db().await;
    let orchestrator =
        Database::from_pool(pool).orchestrator(NullSessionProvider, OrchestratorConfig::default());
    orchestrator.register(scraper(), false).unwrap();

    let mut ids = Vec::new();
    for title in ["Dune", "Emma", "Ubik"] {
        ids.push(
            orchestrator
                .submit("books", json!({"title": title}))
                .await
                .unwrap(),
        );
    }
    for id in &ids {
        let record = tokio::time::timeout(
            Duration::from_secs(10),
            orchestrator.wait(*id, Duration::from_millis(10)),
        )
        .await
        .expect("run finished in time")
        .unwrap();
        assert_eq!(record.status, RunStatus::Succeeded);
    }

    let page = orchestrator
        .query("books", &QuerySpec::new().sort("oldest_first").view("data"))
        .await
        .unwrap();
    assert_eq!(
        page.items,
        vec![
            json!({"title": "Dune"}),
            json!({"title": "Emma"}),
            json!({"title": "Ubik"})
        ]
    );

    let err = orchestrator
        .submit("books", json!({"title": 42}))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation { .. }));
    assert_eq!(
        orchestrator.list_runs("books", None, 100).await.unwrap().len(),
        3
    );
}

#[tokio::test]
async fn recover_reconciles_records_left_by_a_previous_process() {
    let (pool, _container) = setup_test_db().await;
    let store = PgRunStore::new(pool);

    let mut orphan = RunRecord::queued("books", json!({"title": "Dune"}));
    orphan.start().unwrap();
    store.insert(&orphan).await.unwrap();
    let waiting = RunRecord::queued("books", json!({"title": "Emma"}));
    store.insert(&waiting).await.unwrap();

    let orchestrator = Orchestrator::new(store, NullSessionProvider, OrchestratorConfig::default());
    orchestrator.register(scraper(), false).unwrap();

    let report = orchestrator.recover().await.unwrap();
    assert_eq!(report.interrupted, 1);
    assert_eq!(report.promoted, 1);

    let orphan = orchestrator.get_run(orphan.id).await.unwrap();
    assert_eq!(orphan.status, RunStatus::Failed);
    assert_eq!(orphan.error.unwrap().kind, "Interrupted");

    let waiting = tokio::time::timeout(
        Duration::from_secs(10),
        orchestrator.wait(waiting.id, Duration::from_millis(10)),
    )
    .await
    .expect("run finished in time")
    .unwrap();
    assert_eq!(waiting.result, Some(json!({"title": "Emma"})));
}
