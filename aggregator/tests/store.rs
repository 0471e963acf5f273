use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde_json::{json, Map, Value};
use sqlx::PgPool;
use tokio::task::JoinSet;

use aggregator::event::Event;
use aggregator::store::{DedupOutcome, Store};

fn payload(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn sample_event(topic: &str, event_id: &str) -> Event {
    Event {
        topic: topic.to_string(),
        event_id: event_id.to_string(),
        timestamp: Utc.with_ymd_and_hms(2024, 12, 4, 10, 30, 0).unwrap(),
        source: "test-service".to_string(),
        payload: payload(json!({"level": "INFO", "message": "test message"})),
    }
}

async fn count(pool: &PgPool, query: &str) -> i64 {
    let (count,): (i64,) = sqlx::query_as(query)
        .fetch_one(pool)
        .await
        .expect("count query failed");
    count
}

#[sqlx::test(migrations = "../migrations")]
async fn first_insert_is_new_then_duplicate(pool: PgPool) {
    let store = Store::from_pool(pool.clone());
    let event = sample_event("t", "abcd1234");

    let first = store.insert_event_idempotent(&event, "main").await.unwrap();
    assert_eq!(first, DedupOutcome::Inserted);
    assert!(first.is_new());

    let second = store.insert_event_idempotent(&event, "main").await.unwrap();
    assert_eq!(second, DedupOutcome::Duplicate);

    let stats = store.get_statistics().await.unwrap();
    assert_eq!(stats.received, 2);
    assert_eq!(stats.unique_processed, 1);
    assert_eq!(stats.duplicate_dropped, 1);
    assert_eq!(stats.received, stats.unique_processed + stats.duplicate_dropped);

    assert_eq!(count(&pool, "SELECT COUNT(*) FROM events").await, 1);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM processed_events").await, 1);
}

#[sqlx::test(migrations = "../migrations")]
async fn audit_log_traces_every_decision(pool: PgPool) {
    let store = Store::from_pool(pool.clone());
    let event = sample_event("audited", "evt-audit-001");

    store.insert_event_idempotent(&event, "worker-7").await.unwrap();
    store.insert_event_idempotent(&event, "worker-8").await.unwrap();

    let inserts: Vec<(Value,)> = sqlx::query_as(
        "SELECT details FROM audit_log WHERE operation = 'INSERT' AND topic = $1 AND event_id = $2",
    )
    .bind(&event.topic)
    .bind(&event.event_id)
    .fetch_all(&pool)
    .await
    .unwrap();

    assert_eq!(inserts.len(), 1);
    assert_eq!(inserts[0].0["source"], "test-service");
    assert_eq!(inserts[0].0["worker_id"], "worker-7");

    let duplicates: Vec<(Value,)> = sqlx::query_as(
        "SELECT details FROM audit_log WHERE operation = 'DUPLICATE' AND topic = $1 AND event_id = $2",
    )
    .bind(&event.topic)
    .bind(&event.event_id)
    .fetch_all(&pool)
    .await
    .unwrap();

    assert_eq!(duplicates.len(), 1);
    assert_eq!(duplicates[0].0["worker_id"], "worker-8");
}

#[sqlx::test(migrations = "../migrations")]
async fn concurrent_submissions_accept_exactly_one(pool: PgPool) {
    let store = Arc::new(Store::from_pool(pool.clone()));
    let event = sample_event("concurrent", "evt-storm-001");

    let mut tasks = JoinSet::new();
    for i in 0..10 {
        let store = store.clone();
        let event = event.clone();
        tasks.spawn(async move {
            store
                .insert_event_idempotent(&event, &format!("worker-{i}"))
                .await
                .expect("insert failed")
        });
    }

    let mut new_count = 0;
    let mut duplicate_count = 0;
    while let Some(outcome) = tasks.join_next().await {
        match outcome.unwrap() {
            DedupOutcome::Inserted => new_count += 1,
            DedupOutcome::Duplicate => duplicate_count += 1,
        }
    }

    assert_eq!(new_count, 1);
    assert_eq!(duplicate_count, 9);

    assert_eq!(count(&pool, "SELECT COUNT(*) FROM events").await, 1);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM processed_events").await, 1);
    assert_eq!(
        count(&pool, "SELECT COUNT(*) FROM audit_log WHERE operation = 'INSERT'").await,
        1
    );

    let stats = store.get_statistics().await.unwrap();
    assert_eq!(stats.received, 10);
    assert_eq!(stats.unique_processed, 1);
    assert_eq!(stats.duplicate_dropped, 9);
}

#[sqlx::test(migrations = "../migrations")]
async fn same_event_id_under_different_topics_is_two_events(pool: PgPool) {
    let store = Store::from_pool(pool.clone());

    let outcome_a = store
        .insert_event_idempotent(&sample_event("topic-a", "xid12345"), "main")
        .await
        .unwrap();
    let outcome_b = store
        .insert_event_idempotent(&sample_event("topic-b", "xid12345"), "main")
        .await
        .unwrap();

    assert!(outcome_a.is_new());
    assert!(outcome_b.is_new());
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM events").await, 2);

    let stats = store.get_statistics().await.unwrap();
    assert_eq!(stats.topics, vec!["topic-a".to_string(), "topic-b".to_string()]);
    assert_eq!(stats.topic_counts.get("topic-a"), Some(&1));
    assert_eq!(stats.topic_counts.get("topic-b"), Some(&1));
}

#[sqlx::test(migrations = "../migrations")]
async fn batch_with_internal_duplicates_counts_one_unique(pool: PgPool) {
    let store = Store::from_pool(pool.clone());
    let batch: Vec<Event> = (0..5).map(|_| sample_event("bt", "dupA1234")).collect();

    let outcome = store.batch_insert_events_atomic(&batch, "main").await.unwrap();

    assert_eq!(outcome.total, 5);
    assert_eq!(outcome.new_count, 1);
    assert_eq!(outcome.duplicate_count, 4);

    let stats = store.get_statistics().await.unwrap();
    assert_eq!(stats.received, 5);
    assert_eq!(stats.unique_processed, 1);
    assert_eq!(stats.duplicate_dropped, 4);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM events").await, 1);
}

#[sqlx::test(migrations = "../migrations")]
async fn batch_resubmission_drops_every_row(pool: PgPool) {
    let store = Store::from_pool(pool.clone());
    let batch: Vec<Event> = (0..3)
        .map(|i| sample_event("resubmit", &format!("evt-batch-{i:04}")))
        .collect();

    let first = store.batch_insert_events_atomic(&batch, "main").await.unwrap();
    assert_eq!(first.new_count, 3);
    assert_eq!(first.duplicate_count, 0);

    let second = store.batch_insert_events_atomic(&batch, "main").await.unwrap();
    assert_eq!(second.new_count, 0);
    assert_eq!(second.duplicate_count, 3);

    let stats = store.get_statistics().await.unwrap();
    assert_eq!(stats.received, 6);
    assert_eq!(stats.unique_processed, 3);
    assert_eq!(stats.duplicate_dropped, 3);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM events").await, 3);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM processed_events").await, 3);
}

#[sqlx::test(migrations = "../migrations")]
async fn get_events_orders_by_timestamp_desc(pool: PgPool) {
    let store = Store::from_pool(pool);

    for (i, hour) in [9, 11, 10].iter().enumerate() {
        let mut event = sample_event("ordered", &format!("evt-order-{i:04}"));
        event.timestamp = Utc.with_ymd_and_hms(2024, 12, 4, *hour, 0, 0).unwrap();
        store.insert_event_idempotent(&event, "main").await.unwrap();
    }

    let events = store.get_events(Some("ordered"), 100, 0).await.unwrap();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].event_id, "evt-order-0001");
    assert_eq!(events[1].event_id, "evt-order-0002");
    assert_eq!(events[2].event_id, "evt-order-0000");

    let limited = store.get_events(Some("ordered"), 1, 1).await.unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].event_id, "evt-order-0002");

    let other_topic = store.get_events(Some("missing"), 100, 0).await.unwrap();
    assert!(other_topic.is_empty());
}

#[sqlx::test(migrations = "../migrations")]
async fn event_record_preserves_payload(pool: PgPool) {
    let store = Store::from_pool(pool);
    let mut event = sample_event("payloads", "evt-payload-01");
    event.payload = payload(json!({"user_id": "12345", "nested": {"a": [1, 2, 3]}}));

    store.insert_event_idempotent(&event, "main").await.unwrap();

    let events = store.get_events(Some("payloads"), 100, 0).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].payload["user_id"], "12345");
    assert_eq!(events[0].payload["nested"]["a"], json!([1, 2, 3]));
    assert_eq!(events[0].source, "test-service");
    assert!(events[0].processed_at.is_some());
}

#[sqlx::test(migrations = "../migrations")]
async fn check_event_exists_is_advisory(pool: PgPool) {
    let store = Store::from_pool(pool);
    let event = sample_event("advisory", "evt-exists-01");

    assert!(!store.check_event_exists("advisory", "evt-exists-01").await.unwrap());

    store.insert_event_idempotent(&event, "main").await.unwrap();

    assert!(store.check_event_exists("advisory", "evt-exists-01").await.unwrap());
    // The probe never replaces the idempotent insert: a second insert still
    // resolves to a duplicate on its own.
    let outcome = store.insert_event_idempotent(&event, "main").await.unwrap();
    assert_eq!(outcome, DedupOutcome::Duplicate);
}

#[sqlx::test(migrations = "../migrations")]
async fn reset_clears_rows_and_zeroes_counters(pool: PgPool) {
    let store = Store::from_pool(pool.clone());

    for i in 0..3 {
        let event = sample_event("resettable", &format!("evt-reset-{i:04}"));
        store.insert_event_idempotent(&event, "main").await.unwrap();
    }

    store.reset().await.unwrap();

    assert_eq!(count(&pool, "SELECT COUNT(*) FROM events").await, 0);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM processed_events").await, 0);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM audit_log").await, 0);

    let stats = store.get_statistics().await.unwrap();
    assert_eq!(stats.received, 0);
    assert_eq!(stats.unique_processed, 0);
    assert_eq!(stats.duplicate_dropped, 0);
    assert!(stats.topics.is_empty());
}

#[sqlx::test(migrations = "../migrations")]
async fn health_check_reports_connected_pool(pool: PgPool) {
    let store = Store::from_pool(pool);

    assert!(store.health_check().await);
}
