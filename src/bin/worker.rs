use detection_dispatch::{
    config::AppConfig,
    db::{self, JobStore, PgJobStore},
    services::{
        inference::{Detector, HttpDetector},
        queue::{Broker, RedisQueue},
        worker::WorkerLoop,
    },
    telemetry,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    telemetry::init_tracing();

    tracing::info!("Starting detection worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    if let Some(addr) = &config.worker_metrics_addr {
        let addr: SocketAddr = addr.parse().expect("Invalid WORKER_METRICS_ADDR");
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .expect("Failed to install Prometheus exporter");
        telemetry::describe_metrics();
        tracing::info!(%addr, "Serving worker metrics");
    }

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(db_pool));

    // Initialize services
    tracing::info!("Initializing services");
    let queue: Arc<dyn Broker> = Arc::new(
        RedisQueue::new(&config.redis_url, config.queue_key.clone())
            .expect("Failed to initialize job queue"),
    );

    let inference_url = config
        .inference_url
        .clone()
        .expect("INFERENCE_URL must be set for worker processes");
    let detector: Arc<dyn Detector> = Arc::new(HttpDetector::new(
        inference_url,
        config.model_name.clone(),
        tokio::runtime::Handle::current(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let concurrency = config.worker_concurrency.max(1);
    tracing::info!(concurrency, model = %config.model_name, "Worker ready, starting job processing loops");

    let mut loops = Vec::with_capacity(concurrency);
    for _ in 0..concurrency {
        let worker = WorkerLoop::new(
            queue.clone(),
            store.clone(),
            detector.clone(),
            config.worker(),
        );
        let mut shutdown = shutdown_rx.clone();
        loops.push(tokio::spawn(async move {
            worker
                .run_until(async move {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                })
                .await;
        }));
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested, finishing in-flight jobs");
    let _ = shutdown_tx.send(true);

    for handle in loops {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Worker loop panicked");
        }
    }
}
