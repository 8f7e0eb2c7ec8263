//! Worker side of the dispatch.
//!
//! A loop pops one job at a time, runs the detector, persists the result and
//! answers on the job's response slot. Errors are contained per job and only
//! ever reported back through the slot.
//!
//! Delivery is at-most-once: a job popped by a worker that dies before
//! publishing is lost, and its submitter times out.

use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::db::JobStore;
use crate::models::detection::DetectionResult;
use crate::models::job::JobId;
use crate::services::inference::{Detector, Inference, InferenceError};
use crate::services::protocol::{response_slot, JobMessage, ResultMessage};
use crate::services::queue::{Broker, QueueError};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub max_payload_bytes: usize,
    /// Lifetime of a published result nobody reads.
    pub slot_ttl: Duration,
    /// Pause after a broker error before popping again.
    pub error_backoff: Duration,
    /// Longest a single pop blocks on the broker. Shutdown is noticed
    /// between pops, so this bounds how long stopping takes.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: 10 * 1024 * 1024,
            slot_ttl: Duration::from_secs(600),
            error_backoff: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// What happened to one popped message.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Undecodable message; nobody is notified.
    Dropped { reason: String },
    Completed {
        job_id: JobId,
        detections: usize,
        processing_time_ms: u64,
    },
    Failed { job_id: JobId, error: String },
}

pub struct WorkerLoop {
    id: Uuid,
    broker: Arc<dyn Broker>,
    store: Arc<dyn JobStore>,
    detector: Arc<dyn Detector>,
    config: WorkerConfig,
}

impl WorkerLoop {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn JobStore>,
        detector: Arc<dyn Detector>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            broker,
            store,
            detector,
            config,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Process jobs forever.
    pub async fn run(&self) {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Process jobs until `shutdown` resolves.
    ///
    /// The pop itself is never cancelled: a message the broker has already
    /// handed over is always processed. Shutdown is checked between bounded
    /// pops of at most `poll_interval`.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        tracing::info!(worker_id = %self.id, model = self.detector.model_name(), "Worker loop started");

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = std::future::ready(()) => {}
            }

            match self.broker.pop_job_timeout(self.config.poll_interval).await {
                Ok(Some(raw)) => {
                    self.handle_message(&raw).await;
                }
                Ok(None) => {}
                Err(QueueError::Closed) => {
                    tracing::info!(worker_id = %self.id, "Broker closed");
                    break;
                }
                Err(e) => {
                    tracing::error!(worker_id = %self.id, error = %e, "Failed to pop job, backing off");
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }
        }

        tracing::info!(worker_id = %self.id, "Worker loop stopped");
    }

    /// Handle one raw queue message end to end.
    pub async fn handle_message(&self, raw: &str) -> JobOutcome {
        let job = match JobMessage::decode(raw) {
            Ok(job) => job,
            Err(e) => {
                metrics::counter!("detection_jobs_dropped_total").increment(1);
                tracing::error!(worker_id = %self.id, error = %e, "Invalid job format, dropping");
                return JobOutcome::Dropped {
                    reason: e.to_string(),
                };
            }
        };

        let job_id = job.job_id;
        let queue_wait_ms = (chrono::Utc::now() - job.enqueued_at).num_milliseconds().max(0);
        tracing::info!(
            worker_id = %self.id,
            job_id = %job_id,
            priority = job.hints.priority,
            queue_wait_ms,
            "Processing job"
        );

        match self.process(&job).await {
            Ok(result) => {
                let detections = result.detections_count();
                let processing_time_ms = result.processing_time_ms;
                metrics::counter!("detection_jobs_completed_total").increment(1);
                tracing::info!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    detections,
                    processing_time_ms,
                    "Job completed"
                );

                self.reply(
                    job_id,
                    ResultMessage::success(job_id, processing_time_ms, detections),
                )
                .await;
                JobOutcome::Completed {
                    job_id,
                    detections,
                    processing_time_ms,
                }
            }
            Err(error) => {
                metrics::counter!("detection_jobs_failed_total").increment(1);
                tracing::error!(worker_id = %self.id, job_id = %job_id, error = %error, "Job failed");

                if let Err(e) = self.store.mark_failed(job_id, &error).await {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to record job failure");
                }
                self.reply(job_id, ResultMessage::failure(job_id, error.clone()))
                    .await;
                JobOutcome::Failed { job_id, error }
            }
        }
    }

    /// Run inference and persist the result. Any error is the job's failure text.
    async fn process(&self, job: &JobMessage) -> Result<DetectionResult, String> {
        let image = job
            .image_bytes(self.config.max_payload_bytes)
            .map_err(|e| e.to_string())?;
        let image_hash = hex::encode(Sha256::digest(&image));

        let detector = self.detector.clone();
        let started = Instant::now();
        let inference = tokio::task::spawn_blocking(move || -> Result<Inference, InferenceError> {
            let inference = detector.detect(&image)?;
            inference.validate()?;
            Ok(inference)
        })
        .await
        .map_err(|e| format!("inference task aborted: {e}"))?
        .map_err(|e| e.to_string())?;
        let elapsed = started.elapsed();
        metrics::histogram!("detection_processing_seconds").record(elapsed.as_secs_f64());

        let result = DetectionResult {
            job_id: job.job_id,
            model_name: self.detector.model_name().to_string(),
            image_width: inference.image_width,
            image_height: inference.image_height,
            image_hash,
            processing_time_ms: elapsed.as_millis() as u64,
            boxes: inference.boxes,
        };

        self.store
            .mark_completed(&result)
            .await
            .map_err(|e| format!("failed to store result: {e}"))?;
        Ok(result)
    }

    /// Publish to the job's slot. The submitter may be gone, so errors stop here.
    async fn reply(&self, job_id: JobId, message: ResultMessage) {
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to encode result");
                return;
            }
        };

        let slot = response_slot(job_id);
        if let Err(e) = self
            .broker
            .publish(&slot, &payload, self.config.slot_ttl)
            .await
        {
            tracing::warn!(job_id = %job_id, slot = %slot, error = %e, "Failed to publish result");
        }
    }
}
