use std::future::ready;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::broker::Broker;
use crate::handlers;
use crate::metrics::setup_metrics_recorder;
use crate::pipeline::IngestPipeline;
use crate::store::Store;
use crate::worker::WorkerPool;

/// Identity recorded for events committed via the direct HTTP path.
pub const DIRECT_WORKER_ID: &str = "main";

/// Process-wide bookkeeping: version, uptime clock and the shutdown latch.
pub struct AppInfo {
    pub version: String,
    started_at: Instant,
    shutting_down: AtomicBool,
}

impl AppInfo {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            started_at: Instant::now(),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub struct State {
    pub store: Arc<Store>,
    pub broker: Arc<dyn Broker + Send + Sync>,
    pub pipeline: Arc<IngestPipeline>,
    pub workers: Arc<WorkerPool>,
    pub app: Arc<AppInfo>,
}

pub fn router(
    store: Arc<Store>,
    broker: Arc<dyn Broker + Send + Sync>,
    workers: Arc<WorkerPool>,
    app: Arc<AppInfo>,
    metrics: bool,
) -> Router {
    let pipeline = Arc::new(IngestPipeline::new(store.clone(), DIRECT_WORKER_ID));
    let state = State {
        store,
        broker,
        pipeline,
        workers,
        app,
    };

    let router = Router::new()
        .route("/publish", post(handlers::publish))
        .route("/publish/batch", post(handlers::publish_batch))
        .route("/publish/queue", post(handlers::publish_queue))
        .route(
            "/events",
            get(handlers::list_events).delete(handlers::reset_events),
        )
        .route("/stats", get(handlers::stats))
        .route("/health", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Only install the global recorder when asked to; doing so when the
    // router is built inside tests does not work well.
    if metrics {
        let recorder_handle = setup_metrics_recorder();
        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}
