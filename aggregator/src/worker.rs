//! Cooperative consumers draining the broker queue.
//!
//! Workers are peers with no leader. Each one loops on a blocking dequeue
//! with a short timeout, so the shared stop flag is observed at least once a
//! second, and an event handed to a worker is always carried to a decision
//! (commit, re-publish or dead-letter) before the loop exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::broker::Broker;
use crate::event::QueuedEvent;
use crate::pipeline::{EventProcessor, IngestPipeline};
use crate::store::Store;

/// How long a dequeue blocks before the stop flag is re-checked.
pub const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(1);
/// Pause after a broker error before polling resumes.
const POLL_BACKOFF: Duration = Duration::from_secs(1);

/// Governs how often a failing event is re-published and how long the
/// failing worker pauses between attempts.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    max_retries: u32,
    delay_seconds: f64,
    backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay_seconds: f64, backoff_multiplier: f64) -> Self {
        Self {
            max_retries,
            delay_seconds: delay_seconds.max(0.0),
            backoff_multiplier: backoff_multiplier.max(0.0),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Backoff slept by the failing worker after re-publishing an event for
    /// its `retries`-th retry.
    pub fn backoff_interval(&self, retries: u32) -> Duration {
        let exponent = retries.saturating_sub(1);
        Duration::from_secs_f64(self.delay_seconds * self.backoff_multiplier.powi(exponent as i32))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay_seconds: 1.0,
            backoff_multiplier: 2.0,
        }
    }
}

/// A single queue consumer.
pub struct QueueWorker {
    name: String,
    broker: Arc<dyn Broker + Send + Sync>,
    processor: Arc<dyn EventProcessor + Send + Sync>,
    retry_policy: RetryPolicy,
    stop: Arc<AtomicBool>,
}

impl QueueWorker {
    pub fn new(
        name: impl Into<String>,
        broker: Arc<dyn Broker + Send + Sync>,
        processor: Arc<dyn EventProcessor + Send + Sync>,
        retry_policy: RetryPolicy,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            name: name.into(),
            broker,
            processor,
            retry_policy,
            stop,
        }
    }

    /// Drain the queue until the stop flag is raised.
    pub async fn run(self) {
        tracing::info!(worker = %self.name, "worker started");

        while !self.stop.load(Ordering::Relaxed) {
            let entry = match self.broker.consume_event(DEQUEUE_TIMEOUT).await {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(error) => {
                    tracing::error!(worker = %self.name, %error, "failed to consume from queue");
                    tokio::time::sleep(POLL_BACKOFF).await;
                    continue;
                }
            };

            self.handle(entry).await;
        }

        tracing::info!(worker = %self.name, "worker stopped");
    }

    async fn handle(&self, entry: QueuedEvent) {
        match self.processor.process(entry.event.clone()).await {
            Ok(outcome) => {
                metrics::counter!("worker_events_processed_total").increment(1);
                tracing::debug!(
                    worker = %self.name,
                    event_id = %entry.event.event_id,
                    is_duplicate = outcome.is_duplicate,
                    "event processed"
                );
            }
            Err(error) => self.handle_failure(entry, &error.to_string()).await,
        }
    }

    async fn handle_failure(&self, mut entry: QueuedEvent, error: &str) {
        if entry.retries < self.retry_policy.max_retries() {
            entry.retries += 1;
            tracing::warn!(
                worker = %self.name,
                event_id = %entry.event.event_id,
                retries = entry.retries,
                error,
                "processing failed, re-publishing for retry"
            );

            if let Err(publish_error) = self.broker.publish_event(&entry).await {
                tracing::error!(
                    worker = %self.name,
                    %publish_error,
                    "failed to re-publish, sinking to dead letter queue"
                );
                self.sink_to_dead_letter(&entry, error).await;
                return;
            }

            metrics::counter!("worker_events_retried_total").increment(1);

            // The backoff runs on the failing worker itself, slowing that
            // worker down rather than scheduling a delayed redelivery.
            tokio::time::sleep(self.retry_policy.backoff_interval(entry.retries)).await;
        } else {
            self.sink_to_dead_letter(&entry, error).await;
        }
    }

    async fn sink_to_dead_letter(&self, entry: &QueuedEvent, error: &str) {
        if let Err(dlq_error) = self.broker.move_to_dead_letter(entry, error).await {
            tracing::error!(
                worker = %self.name,
                %dlq_error,
                event_id = %entry.event.event_id,
                "failed to move event to the dead letter queue"
            );
        }
        metrics::counter!("worker_events_dead_lettered_total").increment(1);
    }
}

/// Owns the worker task handles and the shared stop flag. Holds no other
/// state.
pub struct WorkerPool {
    stop: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Launch `count` workers, each processing under its own identity.
    pub fn spawn(
        count: usize,
        broker: Arc<dyn Broker + Send + Sync>,
        store: Arc<Store>,
        retry_policy: RetryPolicy,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(count);

        for i in 1..=count {
            let name = format!("worker-{i}");
            let pipeline = Arc::new(IngestPipeline::new(store.clone(), name.clone()));
            let worker = QueueWorker::new(
                name,
                broker.clone(),
                pipeline,
                retry_policy.clone(),
                stop.clone(),
            );
            handles.push(tokio::spawn(worker.run()));
        }

        tracing::info!(count, "started background workers");

        Self {
            stop,
            handles: Mutex::new(handles),
        }
    }

    /// Number of workers still running.
    pub fn active(&self) -> usize {
        self.handles
            .lock()
            .expect("poisoned WorkerPool mutex")
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Raise the stop flag and wait for every worker to finish its current
    /// event.
    pub async fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);

        let handles: Vec<JoinHandle<()>> = self
            .handles
            .lock()
            .expect("poisoned WorkerPool mutex")
            .drain(..)
            .collect();

        for handle in handles {
            if let Err(error) = handle.await {
                tracing::error!(%error, "worker task failed to join");
            }
        }

        tracing::info!("all workers stopped");
    }
}
