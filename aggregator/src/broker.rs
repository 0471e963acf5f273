//! Queue transport between the ingest surface and the worker pool.
//!
//! Entries travel as UTF-8 JSON objects (see [`QueuedEvent`] for the wire
//! format). Delivery is at-least-once: the broker does not track
//! acknowledgements, and a worker that fails mid-processing re-publishes the
//! entry itself.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Notify;

use crate::event::QueuedEvent;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("connection failed with: {0}")]
    Connection(#[source] redis::RedisError),
    #[error("{command} command failed with: {error}")]
    Command {
        command: &'static str,
        #[source]
        error: redis::RedisError,
    },
    #[error("failed to encode queue entry: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode queue entry: {0}")]
    Decode(#[source] serde_json::Error),
}

#[async_trait]
pub trait Broker {
    /// Enqueue a single entry at the head of the primary queue.
    async fn publish_event(&self, event: &QueuedEvent) -> Result<(), BrokerError>;

    /// Enqueue a batch so that all entries become visible together.
    async fn publish_batch(&self, events: &[QueuedEvent]) -> Result<usize, BrokerError>;

    /// Blocking tail-pop; returns `None` on timeout.
    async fn consume_event(&self, timeout: Duration) -> Result<Option<QueuedEvent>, BrokerError>;

    /// Length of the primary queue.
    async fn queue_size(&self) -> Result<usize, BrokerError>;

    /// Sink an entry onto the dead-letter list, annotated with `_error` and
    /// `_failed_at`.
    async fn move_to_dead_letter(&self, event: &QueuedEvent, error: &str)
        -> Result<(), BrokerError>;

    async fn health_check(&self) -> bool;
}

fn dead_letter_entry(event: &QueuedEvent, error: &str) -> Result<String, BrokerError> {
    let mut entry = serde_json::to_value(event).map_err(BrokerError::Encode)?;
    if let Value::Object(map) = &mut entry {
        map.insert("_error".to_string(), Value::String(error.to_string()));
        map.insert("_failed_at".to_string(), Value::String(Utc::now().to_rfc3339()));
    }
    serde_json::to_string(&entry).map_err(BrokerError::Encode)
}

/// Redis-backed broker: LPUSH at the head, BRPOP at the tail, so the queue
/// is FIFO. Connections are opened per operation.
pub struct RedisBroker {
    client: redis::Client,
    event_queue: String,
    dead_letter_queue: String,
}

impl RedisBroker {
    /// Connect and verify the broker answers PING before serving traffic.
    pub async fn new(
        url: &str,
        event_queue: &str,
        dead_letter_queue: &str,
    ) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url).map_err(BrokerError::Connection)?;
        let broker = Self {
            client,
            event_queue: event_queue.to_owned(),
            dead_letter_queue: dead_letter_queue.to_owned(),
        };

        let mut conn = broker.connection().await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|error| BrokerError::Command { command: "PING", error })?;

        tracing::info!("broker connected");

        Ok(broker)
    }

    async fn connection(&self) -> Result<redis::aio::Connection, BrokerError> {
        self.client
            .get_async_connection()
            .await
            .map_err(BrokerError::Connection)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish_event(&self, event: &QueuedEvent) -> Result<(), BrokerError> {
        let entry = serde_json::to_string(event).map_err(BrokerError::Encode)?;
        let mut conn = self.connection().await?;

        conn.lpush::<_, _, i64>(&self.event_queue, entry)
            .await
            .map_err(|error| BrokerError::Command { command: "LPUSH", error })?;

        tracing::debug!(event_id = %event.event.event_id, "event published");

        Ok(())
    }

    async fn publish_batch(&self, events: &[QueuedEvent]) -> Result<usize, BrokerError> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for event in events {
            let entry = serde_json::to_string(event).map_err(BrokerError::Encode)?;
            pipe.lpush(&self.event_queue, entry).ignore();
        }

        let mut conn = self.connection().await?;
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|error| BrokerError::Command { command: "EXEC", error })?;

        tracing::info!(count = events.len(), "batch of events published");

        Ok(events.len())
    }

    async fn consume_event(&self, timeout: Duration) -> Result<Option<QueuedEvent>, BrokerError> {
        let mut conn = self.connection().await?;

        let reply: Option<(String, String)> = conn
            .brpop(&self.event_queue, timeout.as_secs() as f64)
            .await
            .map_err(|error| BrokerError::Command { command: "BRPOP", error })?;

        match reply {
            Some((_, entry)) => Ok(Some(serde_json::from_str(&entry).map_err(BrokerError::Decode)?)),
            None => Ok(None),
        }
    }

    async fn queue_size(&self) -> Result<usize, BrokerError> {
        let mut conn = self.connection().await?;

        conn.llen(&self.event_queue)
            .await
            .map_err(|error| BrokerError::Command { command: "LLEN", error })
    }

    async fn move_to_dead_letter(
        &self,
        event: &QueuedEvent,
        error: &str,
    ) -> Result<(), BrokerError> {
        let entry = dead_letter_entry(event, error)?;
        let mut conn = self.connection().await?;

        conn.lpush::<_, _, i64>(&self.dead_letter_queue, entry)
            .await
            .map_err(|error| BrokerError::Command { command: "LPUSH", error })?;

        tracing::warn!(
            topic = %event.event.topic,
            event_id = %event.event.event_id,
            "event moved to the dead letter queue"
        );

        Ok(())
    }

    async fn health_check(&self) -> bool {
        let mut conn = match self.connection().await {
            Ok(conn) => conn,
            Err(error) => {
                tracing::error!(%error, "broker health check failed");
                return false;
            }
        };

        match redis::cmd("PING").query_async::<_, String>(&mut conn).await {
            Ok(_) => true,
            Err(error) => {
                tracing::error!(%error, "broker health check failed");
                false
            }
        }
    }
}

/// In-process broker with the same wire encoding and FIFO discipline as
/// [`RedisBroker`]. Used by tests and by worker-loop exercises that should
/// not depend on a live Redis.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    queues: Arc<Mutex<MemoryQueues>>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct MemoryQueues {
    events: VecDeque<String>,
    dead_letters: Vec<String>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoded dead-letter entries, oldest first.
    pub fn dead_letter_entries(&self) -> Vec<Value> {
        self.queues
            .lock()
            .expect("poisoned MemoryBroker mutex")
            .dead_letters
            .iter()
            .map(|entry| serde_json::from_str(entry).expect("invalid dead letter entry"))
            .collect()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish_event(&self, event: &QueuedEvent) -> Result<(), BrokerError> {
        let entry = serde_json::to_string(event).map_err(BrokerError::Encode)?;
        self.queues
            .lock()
            .expect("poisoned MemoryBroker mutex")
            .events
            .push_front(entry);
        self.notify.notify_one();
        Ok(())
    }

    async fn publish_batch(&self, events: &[QueuedEvent]) -> Result<usize, BrokerError> {
        let entries = events
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()
            .map_err(BrokerError::Encode)?;

        let mut queues = self.queues.lock().expect("poisoned MemoryBroker mutex");
        for entry in entries {
            queues.events.push_front(entry);
        }
        drop(queues);

        self.notify.notify_waiters();
        Ok(events.len())
    }

    async fn consume_event(&self, timeout: Duration) -> Result<Option<QueuedEvent>, BrokerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let entry = self
                .queues
                .lock()
                .expect("poisoned MemoryBroker mutex")
                .events
                .pop_back();

            if let Some(entry) = entry {
                return Ok(Some(serde_json::from_str(&entry).map_err(BrokerError::Decode)?));
            }

            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn queue_size(&self) -> Result<usize, BrokerError> {
        Ok(self
            .queues
            .lock()
            .expect("poisoned MemoryBroker mutex")
            .events
            .len())
    }

    async fn move_to_dead_letter(
        &self,
        event: &QueuedEvent,
        error: &str,
    ) -> Result<(), BrokerError> {
        let entry = dead_letter_entry(event, error)?;
        self.queues
            .lock()
            .expect("poisoned MemoryBroker mutex")
            .dead_letters
            .push(entry);
        Ok(())
    }

    async fn health_check(&self) -> bool {
        true
    }
}
