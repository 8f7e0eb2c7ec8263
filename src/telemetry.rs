use tracing_subscriber::EnvFilter;

/// Initialize structured JSON logging, `info` unless `RUST_LOG` says otherwise.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();
}

/// Register descriptions for every metric the API and workers emit.
pub fn describe_metrics() {
    metrics::describe_counter!(
        "detection_jobs_submitted_total",
        "Total detection jobs enqueued"
    );
    metrics::describe_counter!(
        "detection_jobs_completed_total",
        "Total detection jobs completed by workers"
    );
    metrics::describe_counter!(
        "detection_jobs_failed_total",
        "Total detection jobs that failed in a worker"
    );
    metrics::describe_counter!(
        "detection_jobs_timed_out_total",
        "Total synchronous requests that stopped waiting for their job"
    );
    metrics::describe_counter!(
        "detection_jobs_dropped_total",
        "Total undecodable queue messages discarded by workers"
    );
    metrics::describe_counter!(
        "detection_enqueue_errors_total",
        "Total submissions that could not reach the broker"
    );
    metrics::describe_histogram!(
        "detection_processing_seconds",
        "Time spent in the inference engine per job"
    );
    metrics::describe_histogram!(
        "detection_request_seconds",
        "End-to-end latency of synchronous detection requests"
    );
    metrics::describe_gauge!(
        "detection_queue_depth",
        "Current number of pending jobs in the queue"
    );
}
