//! # Store gateway
//!
//! Transactional operations against the durable Postgres store. Every piece
//! of SQL in the aggregator lives here; no other component holds a
//! connection.
//!
//! Deduplication relies on the `UNIQUE (topic, event_id)` constraint rather
//! than any read-before-write: under READ COMMITTED, concurrent inserts of
//! the same key are serialised by the constraint, and the losing writer
//! observes zero affected rows and takes the duplicate branch.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};
use thiserror::Error;

use crate::event::Event;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

const INSERT_RETRY_ATTEMPTS: u32 = 3;
const INSERT_RETRY_MIN_BACKOFF: Duration = Duration::from_secs(1);
const INSERT_RETRY_MAX_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {0}")]
    Connection(#[source] sqlx::Error),
    #[error("{command} query failed with: {error}")]
    Query {
        command: &'static str,
        #[source]
        error: sqlx::Error,
    },
    #[error("store unavailable after {attempts} attempts: {error}")]
    Unavailable {
        attempts: u32,
        #[source]
        error: sqlx::Error,
    },
}

/// The dedup decision for a single idempotent insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    /// This call committed the first row for the `(topic, event_id)` key.
    Inserted,
    /// The key already had a committed row; only counters and audit moved.
    Duplicate,
}

impl DedupOutcome {
    pub fn is_new(self) -> bool {
        matches!(self, DedupOutcome::Inserted)
    }
}

/// Result of an atomic batch insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    pub total: usize,
    pub new_count: usize,
    pub duplicate_count: usize,
}

/// Aggregate counters and per-topic breakdown.
#[derive(Debug, Default, Serialize)]
pub struct Statistics {
    pub received: i64,
    pub unique_processed: i64,
    pub duplicate_dropped: i64,
    pub topics: Vec<String>,
    pub topic_counts: HashMap<String, i64>,
}

/// An event row as returned by queries.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct EventRecord {
    pub topic: String,
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Connect a pool to the store. `COMMAND_TIMEOUT` bounds how long any
    /// caller waits for a connection before the operation fails.
    pub async fn new(
        url: &str,
        min_connections: u32,
        max_connections: u32,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .min_connections(min_connections)
            .max_connections(max_connections)
            .acquire_timeout(COMMAND_TIMEOUT)
            .connect(url)
            .await
            .map_err(StoreError::Connection)?;

        tracing::info!("store connection pool established");

        Ok(Self { pool })
    }

    /// Build a store on an existing pool. Used by tests.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("store connection pool closed");
    }

    /// Persist an event exactly once, whatever the delivery count.
    ///
    /// The whole decision runs in one READ COMMITTED transaction: the
    /// conflict-aware insert, the matching `processed_events` row, the
    /// counter updates and the audit entry all commit or roll back together.
    /// Transient transport errors are retried with exponential backoff; a
    /// rolled-back transaction left no visible effect, and a committed one
    /// returns before any retry can run.
    pub async fn insert_event_idempotent(
        &self,
        event: &Event,
        worker_id: &str,
    ) -> Result<DedupOutcome, StoreError> {
        let mut attempt = 0;
        let mut backoff = INSERT_RETRY_MIN_BACKOFF;

        loop {
            attempt += 1;
            let error = match self.try_insert_event(event, worker_id).await {
                Ok(outcome) => return Ok(outcome),
                Err(StoreError::Query { error, .. }) if is_transient(&error) => error,
                Err(other) => return Err(other),
            };

            if attempt >= INSERT_RETRY_ATTEMPTS {
                return Err(StoreError::Unavailable { attempts: attempt, error });
            }

            tracing::warn!(%error, attempt, "transient store error, retrying idempotent insert");
            tokio::time::sleep(backoff).await;
            backoff = std::cmp::min(backoff * 2, INSERT_RETRY_MAX_BACKOFF);
        }
    }

    async fn try_insert_event(
        &self,
        event: &Event,
        worker_id: &str,
    ) -> Result<DedupOutcome, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::Query { command: "BEGIN", error })?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
            .execute(&mut *tx)
            .await
            .map_err(|error| StoreError::Query { command: "SET TRANSACTION", error })?;

        let inserted = sqlx::query(
            r#"
INSERT INTO events (topic, event_id, timestamp, source, payload, processed_at)
VALUES ($1, $2, $3, $4, $5, NOW())
ON CONFLICT (topic, event_id) DO NOTHING
            "#,
        )
        .bind(&event.topic)
        .bind(&event.event_id)
        .bind(event.timestamp)
        .bind(&event.source)
        .bind(Json(&event.payload))
        .execute(&mut *tx)
        .await
        .map_err(|error| StoreError::Query { command: "INSERT", error })?
        .rows_affected()
            == 1;

        if inserted {
            // Same conflict guard as the events insert, so a retried
            // transaction can never double-record the processing.
            sqlx::query(
                r#"
INSERT INTO processed_events (topic, event_id, worker_id)
VALUES ($1, $2, $3)
ON CONFLICT (topic, event_id) DO NOTHING
                "#,
            )
            .bind(&event.topic)
            .bind(&event.event_id)
            .bind(worker_id)
            .execute(&mut *tx)
            .await
            .map_err(|error| StoreError::Query { command: "INSERT", error })?;

            bump_statistic(&mut tx, "unique_processed", 1).await?;
            append_audit(
                &mut tx,
                "INSERT",
                event,
                json!({"source": event.source, "worker_id": worker_id}),
            )
            .await?;
        } else {
            bump_statistic(&mut tx, "duplicate_dropped", 1).await?;
            append_audit(&mut tx, "DUPLICATE", event, json!({"worker_id": worker_id})).await?;
        }

        bump_statistic(&mut tx, "received", 1).await?;

        tx.commit()
            .await
            .map_err(|error| StoreError::Query { command: "COMMIT", error })?;

        if inserted {
            tracing::info!(topic = %event.topic, event_id = %event.event_id, "new event processed");
            Ok(DedupOutcome::Inserted)
        } else {
            tracing::info!(topic = %event.topic, event_id = %event.event_id, "duplicate event dropped");
            Ok(DedupOutcome::Duplicate)
        }
    }

    /// Insert a batch in a single transaction: either every row decision and
    /// every counter update becomes visible, or none of them do. Duplicates
    /// within the batch are normal; they simply land on the duplicate side
    /// of the counters.
    ///
    /// The batch path does not append per-row audit entries; the
    /// single-insert path stays fully audited.
    pub async fn batch_insert_events_atomic(
        &self,
        events: &[Event],
        worker_id: &str,
    ) -> Result<BatchOutcome, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::Query { command: "BEGIN", error })?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
            .execute(&mut *tx)
            .await
            .map_err(|error| StoreError::Query { command: "SET TRANSACTION", error })?;

        let mut new_count = 0usize;

        for event in events {
            let inserted = sqlx::query(
                r#"
INSERT INTO events (topic, event_id, timestamp, source, payload, processed_at)
VALUES ($1, $2, $3, $4, $5, NOW())
ON CONFLICT (topic, event_id) DO NOTHING
                "#,
            )
            .bind(&event.topic)
            .bind(&event.event_id)
            .bind(event.timestamp)
            .bind(&event.source)
            .bind(Json(&event.payload))
            .execute(&mut *tx)
            .await
            .map_err(|error| StoreError::Query { command: "INSERT", error })?
            .rows_affected()
                == 1;

            if inserted {
                sqlx::query(
                    r#"
INSERT INTO processed_events (topic, event_id, worker_id)
VALUES ($1, $2, $3)
ON CONFLICT (topic, event_id) DO NOTHING
                    "#,
                )
                .bind(&event.topic)
                .bind(&event.event_id)
                .bind(worker_id)
                .execute(&mut *tx)
                .await
                .map_err(|error| StoreError::Query { command: "INSERT", error })?;

                new_count += 1;
            }
        }

        let total = events.len();
        let duplicate_count = total - new_count;

        bump_statistic(&mut tx, "received", total as i64).await?;
        bump_statistic(&mut tx, "unique_processed", new_count as i64).await?;
        bump_statistic(&mut tx, "duplicate_dropped", duplicate_count as i64).await?;

        tx.commit()
            .await
            .map_err(|error| StoreError::Query { command: "COMMIT", error })?;

        tracing::info!(total, new = new_count, duplicates = duplicate_count, "batch processed");

        Ok(BatchOutcome { total, new_count, duplicate_count })
    }

    /// Events ordered by producer timestamp, newest first.
    pub async fn get_events(
        &self,
        topic: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let events = match topic {
            Some(topic) => {
                sqlx::query_as::<_, EventRecord>(
                    r#"
SELECT topic, event_id, timestamp, source, payload, received_at, processed_at
FROM events
WHERE topic = $1
ORDER BY timestamp DESC
LIMIT $2 OFFSET $3
                    "#,
                )
                .bind(topic)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, EventRecord>(
                    r#"
SELECT topic, event_id, timestamp, source, payload, received_at, processed_at
FROM events
ORDER BY timestamp DESC
LIMIT $1 OFFSET $2
                    "#,
                )
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|error| StoreError::Query { command: "SELECT", error })?;

        Ok(events)
    }

    /// Aggregate counters plus the per-topic breakdown. The three reads
    /// share a pool, not a snapshot: counters may slightly lead the topic
    /// counts under concurrent writes.
    pub async fn get_statistics(&self) -> Result<Statistics, StoreError> {
        let counters: Vec<(String, i64)> =
            sqlx::query_as("SELECT stat_key, stat_value FROM statistics")
                .fetch_all(&self.pool)
                .await
                .map_err(|error| StoreError::Query { command: "SELECT", error })?;

        let topics: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT topic FROM events ORDER BY topic")
                .fetch_all(&self.pool)
                .await
                .map_err(|error| StoreError::Query { command: "SELECT", error })?;

        let topic_counts: Vec<(String, i64)> = sqlx::query_as(
            "SELECT topic, COUNT(*) FROM events GROUP BY topic ORDER BY COUNT(*) DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StoreError::Query { command: "SELECT", error })?;

        let mut statistics = Statistics::default();
        for (key, value) in counters {
            match key.as_str() {
                "received" => statistics.received = value,
                "unique_processed" => statistics.unique_processed = value,
                "duplicate_dropped" => statistics.duplicate_dropped = value,
                _ => {}
            }
        }
        statistics.topics = topics.into_iter().map(|(topic,)| topic).collect();
        statistics.topic_counts = topic_counts.into_iter().collect();

        Ok(statistics)
    }

    /// Advisory existence probe. A concurrent insert can land between this
    /// check and any follow-up write, so callers must still rely on the
    /// idempotent insert for the dedup decision.
    pub async fn check_event_exists(
        &self,
        topic: &str,
        event_id: &str,
    ) -> Result<bool, StoreError> {
        let row: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM events WHERE topic = $1 AND event_id = $2")
                .bind(topic)
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|error| StoreError::Query { command: "SELECT", error })?;

        Ok(row.is_some())
    }

    pub async fn health_check(&self) -> bool {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => true,
            Err(error) => {
                tracing::error!(%error, "database health check failed");
                false
            }
        }
    }

    /// Clear every event, processing record and audit row and zero the
    /// counters. Backs `DELETE /events`; intended for test fixtures only.
    pub async fn reset(&self) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::Query { command: "BEGIN", error })?;

        sqlx::query("TRUNCATE events, processed_events, audit_log RESTART IDENTITY")
            .execute(&mut *tx)
            .await
            .map_err(|error| StoreError::Query { command: "TRUNCATE", error })?;

        sqlx::query("UPDATE statistics SET stat_value = 0, updated_at = NOW()")
            .execute(&mut *tx)
            .await
            .map_err(|error| StoreError::Query { command: "UPDATE", error })?;

        tx.commit()
            .await
            .map_err(|error| StoreError::Query { command: "COMMIT", error })?;

        Ok(())
    }
}

async fn bump_statistic(
    tx: &mut Transaction<'_, Postgres>,
    key: &'static str,
    by: i64,
) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE statistics SET stat_value = stat_value + $1, updated_at = NOW() WHERE stat_key = $2",
    )
    .bind(by)
    .bind(key)
    .execute(&mut **tx)
    .await
    .map_err(|error| StoreError::Query { command: "UPDATE", error })?;

    Ok(())
}

async fn append_audit(
    tx: &mut Transaction<'_, Postgres>,
    operation: &'static str,
    event: &Event,
    details: Value,
) -> Result<(), StoreError> {
    sqlx::query("INSERT INTO audit_log (operation, topic, event_id, details) VALUES ($1, $2, $3, $4)")
        .bind(operation)
        .bind(&event.topic)
        .bind(&event.event_id)
        .bind(details)
        .execute(&mut **tx)
        .await
        .map_err(|error| StoreError::Query { command: "INSERT", error })?;

    Ok(())
}

/// Transport-level failures worth retrying. Constraint violations and other
/// database errors are final.
fn is_transient(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}
