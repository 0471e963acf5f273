//! The ingest pipeline: validation plus the idempotent insert, shared by the
//! direct HTTP path and the queue workers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::event::{Event, ValidationError};
use crate::store::{Store, StoreError};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Caller-facing result of one ingest decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub is_new: bool,
    pub is_duplicate: bool,
    pub received_at: DateTime<Utc>,
}

#[async_trait]
pub trait EventProcessor {
    async fn process(&self, event: Event) -> Result<ProcessOutcome, PipelineError>;
}

/// Validates the typed contract and drives the event through the store's
/// idempotent insert under this pipeline's worker identity. Timestamp
/// normalisation (trailing `Z` or explicit offset) already happened at
/// deserialisation, so everything here is local until the store call.
pub struct IngestPipeline {
    store: Arc<Store>,
    worker_id: String,
}

impl IngestPipeline {
    pub fn new(store: Arc<Store>, worker_id: impl Into<String>) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
        }
    }
}

#[async_trait]
impl EventProcessor for IngestPipeline {
    async fn process(&self, mut event: Event) -> Result<ProcessOutcome, PipelineError> {
        event.validate()?;

        let outcome = self
            .store
            .insert_event_idempotent(&event, &self.worker_id)
            .await?;

        Ok(ProcessOutcome {
            is_new: outcome.is_new(),
            is_duplicate: !outcome.is_new(),
            received_at: Utc::now(),
        })
    }
}
