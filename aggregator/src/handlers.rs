use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;

use crate::api::{
    BatchPublishRequest, BatchPublishResponse, EventsListResponse, HealthResponse, IngestError,
    MessageResponse, PublishResponse, StatsResponse, MAX_BATCH_SIZE, MAX_EVENTS_LIMIT,
};
use crate::broker::Broker;
use crate::event::{Event, QueuedEvent};
use crate::pipeline::EventProcessor;
use crate::router;
use crate::time::format_uptime;

const DEFAULT_EVENTS_LIMIT: i64 = 100;

pub async fn publish(
    State(state): State<router::State>,
    Json(mut event): Json<Event>,
) -> Result<Json<PublishResponse>, IngestError> {
    if state.app.is_shutting_down() {
        return Err(IngestError::ShuttingDown);
    }

    event.validate()?;
    let event_id = event.event_id.clone();

    let outcome = state.pipeline.process(event).await?;

    metrics::counter!("events_received_total", &[("endpoint", "publish")]).increment(1);
    if outcome.is_duplicate {
        metrics::counter!("events_duplicate_total").increment(1);
    }

    Ok(Json(PublishResponse {
        success: true,
        message: if outcome.is_duplicate {
            "Duplicate event dropped".to_string()
        } else {
            "Event processed".to_string()
        },
        event_id,
        is_duplicate: outcome.is_duplicate,
        received_at: outcome.received_at,
    }))
}

pub async fn publish_batch(
    State(state): State<router::State>,
    Json(request): Json<BatchPublishRequest>,
) -> Result<Json<BatchPublishResponse>, IngestError> {
    if state.app.is_shutting_down() {
        return Err(IngestError::ShuttingDown);
    }
    if request.events.is_empty() {
        return Err(IngestError::EmptyBatch);
    }
    if request.events.len() > MAX_BATCH_SIZE {
        return Err(IngestError::BatchTooLarge);
    }

    let mut events = request.events;
    for event in &mut events {
        event.validate()?;
    }

    let outcome = state
        .store
        .batch_insert_events_atomic(&events, router::DIRECT_WORKER_ID)
        .await?;

    metrics::counter!("events_received_total", &[("endpoint", "batch")])
        .increment(outcome.total as u64);

    Ok(Json(BatchPublishResponse {
        success: true,
        total_received: outcome.total,
        unique_processed: outcome.new_count,
        duplicates_dropped: outcome.duplicate_count,
        failed: 0,
    }))
}

pub async fn publish_queue(
    State(state): State<router::State>,
    Json(mut event): Json<Event>,
) -> Result<Json<PublishResponse>, IngestError> {
    if state.app.is_shutting_down() {
        return Err(IngestError::ShuttingDown);
    }

    event.validate()?;
    let event_id = event.event_id.clone();

    state.broker.publish_event(&QueuedEvent::new(event)).await?;

    metrics::counter!("events_received_total", &[("endpoint", "queue")]).increment(1);

    // The dedup decision happens later in a worker, so this path cannot
    // report duplicates.
    Ok(Json(PublishResponse {
        success: true,
        message: "Event queued for processing".to_string(),
        event_id,
        is_duplicate: false,
        received_at: Utc::now(),
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub topic: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_events(
    State(state): State<router::State>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventsListResponse>, IngestError> {
    let limit = query.limit.unwrap_or(DEFAULT_EVENTS_LIMIT);
    if !(1..=MAX_EVENTS_LIMIT).contains(&limit) {
        return Err(IngestError::InvalidLimit);
    }
    let offset = query.offset.unwrap_or(0);
    if offset < 0 {
        return Err(IngestError::InvalidOffset);
    }

    let events = state
        .store
        .get_events(query.topic.as_deref(), limit, offset)
        .await?;

    Ok(Json(EventsListResponse {
        success: true,
        topic: query.topic,
        count: events.len(),
        events,
    }))
}

pub async fn stats(
    State(state): State<router::State>,
) -> Result<Json<StatsResponse>, IngestError> {
    let statistics = state.store.get_statistics().await?;

    let queue_size = match state.broker.queue_size().await {
        Ok(size) => size,
        Err(error) => {
            tracing::warn!(%error, "failed to read queue size for stats");
            0
        }
    };

    let uptime = state.app.uptime_seconds();

    Ok(Json(StatsResponse {
        received: statistics.received,
        unique_processed: statistics.unique_processed,
        duplicate_dropped: statistics.duplicate_dropped,
        topics: statistics.topics,
        topic_counts: statistics.topic_counts,
        uptime_seconds: uptime,
        uptime_formatted: format_uptime(Duration::from_secs_f64(uptime)),
        workers_active: state.workers.active(),
        queue_size,
    }))
}

pub async fn reset_events(
    State(state): State<router::State>,
) -> Result<Json<MessageResponse>, IngestError> {
    state.store.reset().await?;

    tracing::warn!("all events and statistics cleared");

    Ok(Json(MessageResponse {
        success: true,
        message: "All events and statistics cleared".to_string(),
    }))
}

pub async fn health(State(state): State<router::State>) -> Response {
    let (database_up, broker_up) =
        tokio::join!(state.store.health_check(), state.broker.health_check());
    let healthy = database_up && broker_up;

    let body = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" },
        database: if database_up { "connected" } else { "disconnected" },
        broker: if broker_up { "connected" } else { "disconnected" },
        uptime_seconds: state.app.uptime_seconds(),
        version: state.app.version.clone(),
    };

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };

    (status, Json(body)).into_response()
}
