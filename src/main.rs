use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;

use detection_dispatch::{
    app_state::AppState,
    config::AppConfig,
    db::{self, PgJobStore},
    routes,
    services::{queue::RedisQueue, submitter::JobSubmitter},
    telemetry,
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    telemetry::init_tracing();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing detection-dispatch server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    telemetry::describe_metrics();

    // Initialize database connection pool
    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Run database migrations
    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");
    let store = Arc::new(PgJobStore::new(db_pool));

    // Initialize Redis job queue
    tracing::info!(queue = %config.queue_key, "Connecting to Redis job queue");
    let queue = Arc::new(
        RedisQueue::new(&config.redis_url, config.queue_key.clone())
            .expect("Failed to initialize job queue"),
    );

    let submitter = JobSubmitter::new(store.clone(), queue.clone(), config.submitter());
    let state = AppState::new(store, queue, submitter, config.default_timeout());

    let app = routes::router(state, prometheus_handle);

    tracing::info!("Starting detection-dispatch on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
