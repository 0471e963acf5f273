//! Response contract of the ingest surface and the error taxonomy mapping
//! every failure kind to the HTTP layer.

use std::collections::HashMap;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::broker::BrokerError;
use crate::event::{Event, ValidationError};
use crate::pipeline::PipelineError;
use crate::store::{EventRecord, StoreError};

pub const MAX_BATCH_SIZE: usize = 1000;
pub const MAX_EVENTS_LIMIT: i64 = 1000;

#[derive(Debug, Deserialize)]
pub struct BatchPublishRequest {
    pub events: Vec<Event>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishResponse {
    pub success: bool,
    pub message: String,
    pub event_id: String,
    pub is_duplicate: bool,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchPublishResponse {
    pub success: bool,
    pub total_received: usize,
    pub unique_processed: usize,
    pub duplicates_dropped: usize,
    pub failed: usize,
}

#[derive(Debug, Serialize)]
pub struct EventsListResponse {
    pub success: bool,
    pub topic: Option<String>,
    pub count: usize,
    pub events: Vec<EventRecord>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub received: i64,
    pub unique_processed: i64,
    pub duplicate_dropped: i64,
    pub topics: Vec<String>,
    pub topic_counts: HashMap<String, i64>,
    pub uptime_seconds: f64,
    pub uptime_formatted: String,
    pub workers_active: usize,
    pub queue_size: usize,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: &'static str,
    pub broker: &'static str,
    pub uptime_seconds: f64,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: &'static str,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("batch holds no events")]
    EmptyBatch,
    #[error("batch exceeds the maximum of {MAX_BATCH_SIZE} events")]
    BatchTooLarge,
    #[error("limit must be between 1 and {MAX_EVENTS_LIMIT}")]
    InvalidLimit,
    #[error("offset cannot be negative")]
    InvalidOffset,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("the aggregator is shutting down")]
    ShuttingDown,
}

impl From<PipelineError> for IngestError {
    fn from(error: PipelineError) -> Self {
        match error {
            PipelineError::Validation(error) => IngestError::Validation(error),
            PipelineError::Store(error) => IngestError::Store(error),
        }
    }
}

impl IngestError {
    fn kind(&self) -> &'static str {
        match self {
            IngestError::Validation(_)
            | IngestError::EmptyBatch
            | IngestError::BatchTooLarge
            | IngestError::InvalidLimit
            | IngestError::InvalidOffset => "validation_error",
            IngestError::Store(_) => "store_unavailable",
            IngestError::Broker(_) => "broker_unavailable",
            IngestError::ShuttingDown => "shutting_down",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            IngestError::Validation(_)
            | IngestError::EmptyBatch
            | IngestError::BatchTooLarge
            | IngestError::InvalidLimit
            | IngestError::InvalidOffset => StatusCode::UNPROCESSABLE_ENTITY,
            IngestError::Store(_) | IngestError::Broker(_) => StatusCode::INTERNAL_SERVER_ERROR,
            IngestError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            success: false,
            error: self.kind(),
            detail: self.to_string(),
            timestamp: Utc::now(),
        };

        (self.status(), Json(body)).into_response()
    }
}
