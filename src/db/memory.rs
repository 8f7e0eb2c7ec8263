use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::db::store::{JobStore, StoreError};
use crate::models::detection::DetectionResult;
use crate::models::job::{JobId, JobRecord, JobStatus, NewJob};

#[derive(Default)]
struct Tables {
    last_id: i64,
    jobs: HashMap<JobId, JobRecord>,
    results: HashMap<JobId, DetectionResult>,
}

/// In-process job store with switchable failures for exercising error paths.
#[derive(Default)]
pub struct MemoryJobStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
    reject_results: AtomicBool,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make only `mark_completed` fail.
    pub fn set_reject_results(&self, reject: bool) {
        self.reject_results.store(reject, Ordering::SeqCst);
    }

    pub fn job_count(&self) -> usize {
        self.tables().jobs.len()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, job: NewJob) -> Result<JobRecord, StoreError> {
        self.check_available()?;
        let mut tables = self.tables();
        tables.last_id += 1;
        let now = Utc::now();
        let record = JobRecord {
            id: JobId(tables.last_id),
            caller: job.caller,
            status: JobStatus::Queued,
            priority: job.priority,
            request_size: job.request_size,
            model_name: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        tables.jobs.insert(record.id, record.clone());
        Ok(record)
    }

    async fn mark_completed(&self, result: &DetectionResult) -> Result<(), StoreError> {
        self.check_available()?;
        if self.reject_results.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }

        let mut tables = self.tables();
        if tables.results.contains_key(&result.job_id) {
            return Err(StoreError::DuplicateResult(result.job_id));
        }
        let job = tables
            .jobs
            .get_mut(&result.job_id)
            .ok_or(StoreError::JobNotFound(result.job_id))?;

        let now = Utc::now();
        job.status = JobStatus::Completed;
        job.model_name = Some(result.model_name.clone());
        job.error = None;
        job.updated_at = now;
        job.completed_at = Some(now);
        tables.results.insert(result.job_id, result.clone());
        Ok(())
    }

    async fn mark_failed(&self, job_id: JobId, error: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let mut tables = self.tables();
        let job = tables
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        if job.status == JobStatus::Completed {
            return Ok(());
        }

        let now = Utc::now();
        job.status = JobStatus::Failed;
        job.error = Some(error.to_string());
        job.updated_at = now;
        job.completed_at = Some(now);
        Ok(())
    }

    async fn mark_abandoned(&self, job_id: JobId) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut tables = self.tables();
        match tables.jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Queued => {
                job.status = JobStatus::Abandoned;
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError> {
        self.check_available()?;
        Ok(self.tables().jobs.get(&job_id).cloned())
    }

    async fn get_result(&self, job_id: JobId) -> Result<Option<DetectionResult>, StoreError> {
        self.check_available()?;
        Ok(self.tables().results.get(&job_id).cloned())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::CallerId;

    fn new_job() -> NewJob {
        NewJob::new(CallerId::new("user-1"), 1024)
    }

    fn result_for(job_id: JobId) -> DetectionResult {
        DetectionResult {
            job_id,
            model_name: "yolov8n".to_string(),
            image_width: 640,
            image_height: 480,
            image_hash: "ab".repeat(32),
            processing_time_ms: 12,
            boxes: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_ids_strictly_increase() {
        let store = MemoryJobStore::new();
        let a = store.create_job(new_job()).await.unwrap();
        let b = store.create_job(new_job()).await.unwrap();
        assert!(b.id > a.id);
        assert_eq!(a.status, JobStatus::Queued);
        assert_eq!(a.caller.as_str(), "user-1");
    }

    #[tokio::test]
    async fn test_completion_writes_status_and_result_together() {
        let store = MemoryJobStore::new();
        let job = store.create_job(new_job()).await.unwrap();
        store.mark_completed(&result_for(job.id)).await.unwrap();

        let record = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.model_name.as_deref(), Some("yolov8n"));
        assert!(record.completed_at.is_some());
        assert!(store.get_result(job.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_second_result_rejected() {
        let store = MemoryJobStore::new();
        let job = store.create_job(new_job()).await.unwrap();
        store.mark_completed(&result_for(job.id)).await.unwrap();
        let err = store.mark_completed(&result_for(job.id)).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateResult(id) if id == job.id));
    }

    #[tokio::test]
    async fn test_abandon_only_applies_to_queued_jobs() {
        let store = MemoryJobStore::new();
        let queued = store.create_job(new_job()).await.unwrap();
        let done = store.create_job(new_job()).await.unwrap();
        store.mark_completed(&result_for(done.id)).await.unwrap();

        assert!(store.mark_abandoned(queued.id).await.unwrap());
        assert!(!store.mark_abandoned(done.id).await.unwrap());
        assert!(!store.mark_abandoned(JobId(999)).await.unwrap());

        let record = store.get_job(done.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_late_completion_overrides_abandoned() {
        let store = MemoryJobStore::new();
        let job = store.create_job(new_job()).await.unwrap();
        store.mark_abandoned(job.id).await.unwrap();
        store.mark_completed(&result_for(job.id)).await.unwrap();

        let record = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let store = MemoryJobStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.create_job(new_job()).await,
            Err(StoreError::Unavailable)
        ));
        assert!(store.health_check().await.is_err());
    }

    #[tokio::test]
    async fn test_mark_failed_unknown_job() {
        let store = MemoryJobStore::new();
        let err = store.mark_failed(JobId(7), "boom").await.unwrap_err();
        assert!(matches!(err, StoreError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn test_failure_never_downgrades_completed_job() {
        let store = MemoryJobStore::new();
        let job = store.create_job(new_job()).await.unwrap();
        store.mark_completed(&result_for(job.id)).await.unwrap();

        store.mark_failed(job.id, "duplicate result").await.unwrap();

        let record = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert!(record.error.is_none());
        assert!(store.get_result(job.id).await.unwrap().is_some());
    }
}
