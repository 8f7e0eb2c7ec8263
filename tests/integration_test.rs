mod helpers;

use detection_dispatch::{
    config::AppConfig,
    db::{self, JobStore, PgJobStore, StoreError},
    models::detection::DetectionResult,
    models::job::{CallerId, JobId, JobStatus, NewJob},
    services::{
        protocol::{response_slot, ResultMessage},
        queue::{Broker, RedisQueue},
        submitter::{JobSubmitter, SubmitError},
        worker::WorkerLoop,
    },
};
use helpers::{payload, ScriptedDetector};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct Backends {
    config: AppConfig,
    store: Arc<PgJobStore>,
    queue: Arc<RedisQueue>,
}

/// Connect to the PostgreSQL and Redis instances named by the environment.
///
/// Each test gets its own queue key so parallel runs do not steal each
/// other's jobs.
async fn backends() -> Backends {
    let config = AppConfig::from_env().expect("Failed to load config");

    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run migrations");

    let queue_key = format!("{}_{}", config.queue_key, Uuid::new_v4().simple());
    let queue = RedisQueue::new(&config.redis_url, queue_key).expect("Failed to initialize queue");

    Backends {
        config,
        store: Arc::new(PgJobStore::new(db_pool)),
        queue: Arc::new(queue),
    }
}

/// Integration test: full detection flow
///
/// This test verifies the complete integration:
/// 1. Database connection and schema
/// 2. Job queue (push/pop over Redis lists)
/// 3. Response slot publish and blocking wait
/// 4. Result persistence with ordered bounding boxes
///
/// Note: This requires a running PostgreSQL and Redis instance
/// configured via environment variables.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_full_integration() {
    let b = backends().await;
    b.store.health_check().await.expect("database reachable");
    b.queue.health_check().await.expect("redis reachable");

    let worker = WorkerLoop::new(
        b.queue.clone(),
        b.store.clone(),
        Arc::new(ScriptedDetector::fixed(Duration::from_millis(20), 3)),
        b.config.worker(),
    );
    let handle = tokio::spawn(async move { worker.run().await });

    let submitter = JobSubmitter::new(b.store.clone(), b.queue.clone(), b.config.submitter());
    let image = payload(10 * 1024, 9);
    let result = submitter
        .submit(&image, &CallerId::new("integration"), Duration::from_secs(10))
        .await
        .expect("detection succeeds");
    handle.abort();

    assert_eq!(result.detections_count(), 3);

    let record = b.store.get_job(result.job_id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.caller.as_str(), "integration");
    assert_eq!(record.model_name.as_deref(), Some("scripted"));

    let stored = b.store.get_result(result.job_id).await.unwrap().unwrap();
    let classes: Vec<_> = stored.boxes.iter().map(|b| b.class_name.as_str()).collect();
    assert_eq!(classes, ["class_0", "class_1", "class_2"]);
    assert_eq!(stored.image_hash, result.image_hash);

    println!("✅ Full integration test passed!");
}

#[tokio::test]
#[ignore]
async fn test_redis_timeout_and_abandon() {
    let b = backends().await;
    let submitter = JobSubmitter::new(b.store.clone(), b.queue.clone(), b.config.submitter());

    let err = submitter
        .submit(b"nobody listens", &CallerId::anonymous(), Duration::from_secs(1))
        .await
        .unwrap_err();
    let job_id = match err {
        SubmitError::Timeout { job_id, .. } => job_id,
        other => panic!("expected timeout, got {other:?}"),
    };

    let record = b.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Abandoned);
    assert_eq!(b.queue.queue_depth().await.unwrap(), 1);
}

#[tokio::test]
#[ignore]
async fn test_late_failure_overrides_abandoned() {
    let b = backends().await;
    let job = b
        .store
        .create_job(NewJob::new(CallerId::anonymous(), 4))
        .await
        .unwrap();

    assert!(b.store.mark_abandoned(job.id).await.unwrap());
    b.store.mark_failed(job.id, "engine crashed").await.unwrap();

    let record = b.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("engine crashed"));
    // A finished job is never moved back to abandoned.
    assert!(!b.store.mark_abandoned(job.id).await.unwrap());
}

#[tokio::test]
#[ignore]
async fn test_failure_after_completion_keeps_result() {
    let b = backends().await;
    let job = b
        .store
        .create_job(NewJob::new(CallerId::anonymous(), 4))
        .await
        .unwrap();
    let result = DetectionResult {
        job_id: job.id,
        model_name: "yolov8n".to_string(),
        image_width: 640,
        image_height: 480,
        image_hash: "ab".repeat(32),
        processing_time_ms: 12,
        boxes: Vec::new(),
    };
    b.store.mark_completed(&result).await.unwrap();

    b.store.mark_failed(job.id, "duplicate result").await.unwrap();
    let record = b.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert!(record.error.is_none());

    let err = b.store.mark_failed(JobId(i64::MAX), "boom").await.unwrap_err();
    assert!(matches!(err, StoreError::JobNotFound(_)));
}

#[tokio::test]
#[ignore]
async fn test_bounded_pop_over_redis() {
    let b = backends().await;
    let empty = b
        .queue
        .pop_job_timeout(Duration::from_millis(200))
        .await
        .unwrap();
    assert!(empty.is_none());

    b.queue.push_job("first").await.unwrap();
    b.queue.push_job("second").await.unwrap();
    let popped = b.queue.pop_job_timeout(Duration::from_secs(1)).await.unwrap();
    assert_eq!(popped.as_deref(), Some("first"));
    assert_eq!(b.queue.pop_job().await.unwrap(), "second");
}

#[tokio::test]
#[ignore]
async fn test_slot_round_trip_over_redis() {
    let b = backends().await;
    let job = b
        .store
        .create_job(NewJob::new(CallerId::anonymous(), 4))
        .await
        .unwrap();
    let slot = response_slot(job.id);

    let message = ResultMessage::failure(job.id, "boom").encode().unwrap();
    b.queue
        .publish(&slot, &message, Duration::from_secs(5))
        .await
        .unwrap();

    let first = b.queue.wait_slot(&slot, Duration::from_secs(1)).await.unwrap();
    assert_eq!(first.as_deref(), Some(message.as_str()));
    // Consumed exactly once.
    let second = b.queue.wait_slot(&slot, Duration::from_secs(1)).await.unwrap();
    assert!(second.is_none());
}
