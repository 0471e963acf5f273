use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::broker::{Broker, RedisBroker};
use crate::config::Config;
use crate::router::{self, AppInfo};
use crate::store::Store;
use crate::worker::{RetryPolicy, WorkerPool};

/// Bring the aggregator up in dependency order (store, broker, workers,
/// HTTP), run until `shutdown` resolves, then drain in reverse order.
pub async fn serve<F>(config: Config, shutdown: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let store = Arc::new(
        Store::new(
            &config.database_url,
            config.db_pool_min_size,
            config.db_pool_max_size,
        )
        .await
        .expect("failed to connect to the event store"),
    );

    let broker: Arc<dyn Broker + Send + Sync> = Arc::new(
        RedisBroker::new(
            &config.broker_url,
            &config.event_queue_name,
            &config.dead_letter_queue_name,
        )
        .await
        .expect("failed to connect to the broker"),
    );

    let retry_policy = RetryPolicy::new(
        config.retry.max_retries,
        config.retry.retry_delay_seconds,
        config.retry.retry_backoff_multiplier,
    );
    let workers = Arc::new(WorkerPool::spawn(
        config.worker_count,
        broker.clone(),
        store.clone(),
        retry_policy,
    ));

    let app_info = Arc::new(AppInfo::new(config.app_version.clone()));

    // Once the signal arrives, new publishes fail fast with ShuttingDown
    // while in-flight requests drain.
    let shutdown = {
        let app_info = app_info.clone();
        async move {
            shutdown.await;
            app_info.begin_shutdown();
        }
    };

    if config.worker_mode {
        tracing::info!("worker mode enabled, HTTP surface disabled");
        shutdown.await;
    } else {
        let app = router::router(
            store.clone(),
            broker,
            workers.clone(),
            app_info,
            config.export_prometheus,
        );

        let listener = TcpListener::bind(config.address)
            .await
            .expect("failed to bind listener");
        tracing::info!(address = %config.address, "listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .expect("HTTP server failed");
    }

    workers.shutdown().await;
    store.close().await;
    tracing::info!("aggregator shutdown complete");
}
