use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::db::{JobStore, StoreError};
use crate::models::detection::DetectionResult;
use crate::models::job::{CallerId, JobId, NewJob};
use crate::services::protocol::{response_slot, JobHints, JobMessage, ProtocolError, ResultMessage};
use crate::services::queue::{Broker, QueueError};

/// Limits applied to every submission.
#[derive(Debug, Clone)]
pub struct SubmitterConfig {
    pub max_payload_bytes: usize,
    pub max_timeout: Duration,
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: 10 * 1024 * 1024,
            max_timeout: Duration::from_secs(300),
        }
    }
}

/// Request-path side of the dispatch: records a job, enqueues it and waits
/// for the worker's answer on the job's response slot.
pub struct JobSubmitter {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
    config: SubmitterConfig,
}

impl JobSubmitter {
    pub fn new(store: Arc<dyn JobStore>, broker: Arc<dyn Broker>, config: SubmitterConfig) -> Self {
        Self {
            store,
            broker,
            config,
        }
    }

    pub fn config(&self) -> &SubmitterConfig {
        &self.config
    }

    /// Submit an image and wait up to `timeout` for its detections.
    ///
    /// Exactly one job record and one queue message are created per call.
    /// A timeout stops the wait only; the job may still complete later.
    pub async fn submit(
        &self,
        image: &[u8],
        caller: &CallerId,
        timeout: Duration,
    ) -> Result<DetectionResult, SubmitError> {
        self.check_timeout(timeout)?;
        let started = Instant::now();
        let job_id = self.enqueue(image, caller).await?;

        let outcome = self.await_result(job_id, timeout).await;
        metrics::histogram!("detection_request_seconds").record(started.elapsed().as_secs_f64());
        outcome
    }

    /// Record and enqueue a job without waiting for it.
    pub async fn enqueue(&self, image: &[u8], caller: &CallerId) -> Result<JobId, SubmitError> {
        self.check_payload(image)?;

        let record = self
            .store
            .create_job(NewJob::new(caller.clone(), image.len()))
            .await
            .map_err(SubmitError::Store)?;
        let job_id = record.id;

        let hints = JobHints {
            priority: record.priority,
        };
        let payload = JobMessage::new(job_id, image, hints, self.config.max_payload_bytes)
            .and_then(|m| m.encode())
            .map_err(SubmitError::Protocol)?;

        // The record stays `queued` if this fails; nothing retries it.
        if let Err(e) = self.broker.push_job(&payload).await {
            metrics::counter!("detection_enqueue_errors_total").increment(1);
            tracing::error!(job_id = %job_id, error = %e, "Failed to enqueue detection job");
            return Err(SubmitError::Enqueue { job_id, source: e });
        }

        metrics::counter!("detection_jobs_submitted_total").increment(1);
        tracing::info!(
            job_id = %job_id,
            caller = %caller,
            size = image.len(),
            "Detection job queued"
        );
        Ok(job_id)
    }

    /// Wait up to `timeout` for the answer to a job queued by [`enqueue`].
    ///
    /// On timeout the job is marked abandoned. Its result may still appear
    /// in the store later.
    ///
    /// [`enqueue`]: JobSubmitter::enqueue
    pub async fn await_result(
        &self,
        job_id: JobId,
        timeout: Duration,
    ) -> Result<DetectionResult, SubmitError> {
        let started = Instant::now();
        let outcome = self.wait_for(job_id, timeout).await;
        match &outcome {
            Ok(result) => tracing::info!(
                job_id = %job_id,
                detections = result.detections_count(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Detection delivered"
            ),
            Err(SubmitError::Timeout { .. }) => {
                metrics::counter!("detection_jobs_timed_out_total").increment(1);
                tracing::warn!(job_id = %job_id, timeout_ms = timeout.as_millis() as u64, "Gave up waiting for detection");
            }
            Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Detection request failed"),
        }
        outcome
    }

    async fn wait_for(
        &self,
        job_id: JobId,
        timeout: Duration,
    ) -> Result<DetectionResult, SubmitError> {
        let slot = response_slot(job_id);
        let raw = match self.broker.wait_slot(&slot, timeout).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                // A worker that finishes later still overwrites this.
                if let Err(e) = self.store.mark_abandoned(job_id).await {
                    tracing::warn!(job_id = %job_id, error = %e, "Failed to mark job abandoned");
                }
                return Err(SubmitError::Timeout { job_id, timeout });
            }
            Err(e) => return Err(SubmitError::Wait { job_id, source: e }),
        };

        let message = ResultMessage::decode(&raw).map_err(SubmitError::Protocol)?;
        if message.job_id != job_id {
            return Err(SubmitError::Mismatch {
                expected: job_id,
                got: message.job_id,
            });
        }

        if !message.success {
            return Err(SubmitError::JobFailed {
                job_id,
                message: message
                    .error_message
                    .unwrap_or_else(|| "unknown error".to_string()),
            });
        }

        match self.store.get_result(job_id).await {
            Ok(Some(result)) => Ok(result),
            Ok(None) => Err(SubmitError::MissingResult(job_id)),
            Err(e) => Err(SubmitError::Store(e)),
        }
    }

    fn check_payload(&self, image: &[u8]) -> Result<(), SubmitError> {
        if image.is_empty() {
            return Err(SubmitError::InvalidInput("image is empty".to_string()));
        }
        if image.len() > self.config.max_payload_bytes {
            return Err(SubmitError::InvalidInput(format!(
                "image of {} bytes exceeds limit of {} bytes",
                image.len(),
                self.config.max_payload_bytes
            )));
        }
        Ok(())
    }

    /// Reject waits that are zero or above the configured maximum.
    pub fn check_timeout(&self, timeout: Duration) -> Result<(), SubmitError> {
        if timeout.is_zero() {
            return Err(SubmitError::InvalidInput("timeout must be positive".to_string()));
        }
        if timeout > self.config.max_timeout {
            return Err(SubmitError::InvalidInput(format!(
                "timeout exceeds maximum of {}s",
                self.config.max_timeout.as_secs()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Invalid request: {0}")]
    InvalidInput(String),

    #[error("Job store error: {0}")]
    Store(#[source] StoreError),

    #[error("Failed to enqueue job {job_id}: {source}")]
    Enqueue {
        job_id: JobId,
        #[source]
        source: QueueError,
    },

    #[error("Detection for job {job_id} timed out after {}ms", .timeout.as_millis())]
    Timeout { job_id: JobId, timeout: Duration },

    #[error("Detection failed for job {job_id}: {message}")]
    JobFailed { job_id: JobId, message: String },

    #[error("Detection for job {0} processed but not found in store")]
    MissingResult(JobId),

    #[error("Broker error while waiting for job {job_id}: {source}")]
    Wait {
        job_id: JobId,
        #[source]
        source: QueueError,
    },

    #[error("Result for job {got} arrived on the slot of job {expected}")]
    Mismatch { expected: JobId, got: JobId },

    #[error("Protocol error: {0}")]
    Protocol(#[source] ProtocolError),
}

impl SubmitError {
    /// Job the error relates to, when one was created.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            SubmitError::Enqueue { job_id, .. }
            | SubmitError::Timeout { job_id, .. }
            | SubmitError::JobFailed { job_id, .. }
            | SubmitError::Wait { job_id, .. } => Some(*job_id),
            SubmitError::MissingResult(job_id) => Some(*job_id),
            SubmitError::Mismatch { expected, .. } => Some(*expected),
            SubmitError::InvalidInput(_) | SubmitError::Store(_) | SubmitError::Protocol(_) => {
                None
            }
        }
    }
}
