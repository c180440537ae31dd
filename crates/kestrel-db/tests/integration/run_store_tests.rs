use chrono::{Duration, TimeZone, Utc};
use kestrel_core::routine::RoutineError;
use kestrel_core::run::{RunRecord, RunStatus};
use kestrel_core::store::RunStore;
use kestrel_core::AppError;
use kestrel_db::PgRunStore;
use uuid::Uuid;

use crate::integration::common::setup_test_db;

fn record_at(scraper: &str, offset_secs: i64) -> RunRecord {
    let mut record = RunRecord::queued(scraper, serde_json::json!({"url": "https://example.com"}));
    record.created_at =
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap() + Duration::seconds(offset_secs);
    record
}

#[tokio::test]
async fn insert_and_get_roundtrip() {
    let (pool, _container) = setup_test_db().await;
    let store = PgRunStore::new(pool);

    let record = record_at("books", 0);
    store.insert(&record).await.unwrap();

    let loaded = store.get(record.id).await.unwrap().expect("record exists");
    assert_eq!(loaded, record);
    assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn update_persists_terminal_state() {
    let (pool, _container) = setup_test_db().await;
    let store = PgRunStore::new(pool);

    let mut record = record_at("books", 0);
    store.insert(&record).await.unwrap();
    record.start().unwrap();
    record
        .fail(RoutineError::new("Http", "HTTP 503 for https://example.com"))
        .unwrap();
    store.update(&record).await.unwrap();

    let loaded = store.get(record.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, RunStatus::Failed);
    assert_eq!(loaded.error, record.error);
    assert!(loaded.result.is_none());
    assert!(loaded.started_at.is_some());
    assert!(loaded.finished_at.is_some());
}

#[tokio::test]
async fn update_unknown_run_fails() {
    let (pool, _container) = setup_test_db().await;
    let store = PgRunStore::new(pool);

    let err = store.update(&record_at("books", 0)).await.unwrap_err();
    assert!(matches!(err, AppError::UnknownRun(_)));
}

#[tokio::test]
async fn duplicate_insert_is_a_store_error() {
    let (pool, _container) = setup_test_db().await;
    let store = PgRunStore::new(pool);

    let record = record_at("books", 0);
    store.insert(&record).await.unwrap();
    let err = store.insert(&record).await.unwrap_err();
    assert!(matches!(err, AppError::StoreError(_)));
}

#[tokio::test]
async fn oldest_queued_follows_fifo_with_id_tie_break() {
    let (pool, _container) = setup_test_db().await;
    let store = PgRunStore::new(pool);

    let late = record_at("books", 30);
    let mut tie_high = record_at("books", 10);
    let mut tie_low = record_at("books", 10);
    tie_high.id = Uuid::from_u128(0xff);
    tie_low.id = Uuid::from_u128(0x01);
    let other = record_at("movies", 0);
    for r in [&late, &tie_high, &tie_low, &other] {
        store.insert(r).await.unwrap();
    }

    let next = store.oldest_queued("books").await.unwrap().unwrap();
    assert_eq!(next.id, tie_low.id);

    let order: Vec<Uuid> = store
        .list_by_scraper("books")
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(order, vec![tie_low.id, tie_high.id, late.id]);
}

#[tokio::test]
async fn counts_and_status_listings() {
    let (pool, _container) = setup_test_db().await;
    let store = PgRunStore::new(pool);

    let mut running = record_at("books", 0);
    running.start().unwrap();
    store.insert(&running).await.unwrap();
    store.insert(&record_at("books", 1)).await.unwrap();
    store.insert(&record_at("books", 2)).await.unwrap();
    let mut elsewhere = record_at("movies", 3);
    elsewhere.start().unwrap();
    store.insert(&elsewhere).await.unwrap();

    assert_eq!(store.count_by_status("books", RunStatus::Queued).await.unwrap(), 2);
    assert_eq!(store.count_by_status("books", RunStatus::Running).await.unwrap(), 1);
    assert_eq!(store.count_by_status("books", RunStatus::Failed).await.unwrap(), 0);

    let all_running = store.list_by_status(RunStatus::Running).await.unwrap();
    assert_eq!(all_running.len(), 2);
    assert_eq!(all_running[0].id, running.id);

    let recent = store.list_recent("books", None, 2).await.unwrap();
    assert_eq!(recent.len(), 2);
    assert!(recent[0].created_at > recent[1].created_at);

    let recent_running = store
        .list_recent("books", Some(RunStatus::Running), 10)
        .await
        .unwrap();
    assert_eq!(recent_running.len(), 1);
    assert_eq!(recent_running[0].id, running.id);
}
