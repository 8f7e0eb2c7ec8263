use async_trait::async_trait;
use sqlx::PgPool;

use crate::db::queries;
use crate::models::detection::DetectionResult;
use crate::models::job::{JobId, JobRecord, NewJob};

/// Durable table of jobs and their results.
///
/// Writes touch a single job's rows, so workers finishing different jobs
/// never contend with each other.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a `queued` job. Returns only once the record is durable.
    async fn create_job(&self, job: NewJob) -> Result<JobRecord, StoreError>;

    /// Persist the result and mark the job `completed` in one step.
    async fn mark_completed(&self, result: &DetectionResult) -> Result<(), StoreError>;

    /// Mark the job `failed`. A job that already completed keeps its
    /// result and status.
    async fn mark_failed(&self, job_id: JobId, error: &str) -> Result<(), StoreError>;

    /// Mark a still-`queued` job `abandoned`. Returns whether anything changed.
    async fn mark_abandoned(&self, job_id: JobId) -> Result<bool, StoreError>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError>;

    async fn get_result(&self, job_id: JobId) -> Result<Option<DetectionResult>, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

/// PostgreSQL implementation backed by [`queries`].
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create_job(&self, job: NewJob) -> Result<JobRecord, StoreError> {
        Ok(queries::create_job(&self.pool, &job).await?)
    }

    async fn mark_completed(&self, result: &DetectionResult) -> Result<(), StoreError> {
        queries::insert_result(&self.pool, result)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(db) = &e {
                    if db.is_unique_violation() {
                        return StoreError::DuplicateResult(result.job_id);
                    }
                    if db.is_foreign_key_violation() {
                        return StoreError::JobNotFound(result.job_id);
                    }
                }
                StoreError::Database(e)
            })
    }

    async fn mark_failed(&self, job_id: JobId, error: &str) -> Result<(), StoreError> {
        if queries::mark_failed(&self.pool, job_id, error).await? > 0 {
            return Ok(());
        }
        // Nothing updated: either unknown, or completed and left alone.
        match queries::get_job(&self.pool, job_id).await? {
            Some(_) => Ok(()),
            None => Err(StoreError::JobNotFound(job_id)),
        }
    }

    async fn mark_abandoned(&self, job_id: JobId) -> Result<bool, StoreError> {
        Ok(queries::mark_abandoned(&self.pool, job_id).await? > 0)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError> {
        Ok(queries::get_job(&self.pool, job_id).await?)
    }

    async fn get_result(&self, job_id: JobId) -> Result<Option<DetectionResult>, StoreError> {
        Ok(queries::get_result(&self.pool, job_id).await?)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job {0} not found")]
    JobNotFound(JobId),

    #[error("Job {0} already has a result")]
    DuplicateResult(JobId),

    #[error("Job store unavailable")]
    Unavailable,
}
