use axum::extract::rejection::PathRejection;
use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::models::detection::DetectionResult;
use crate::models::job::{JobId, JobRecord, JobStatus};
use crate::routes::error::ApiError;

/// Response after queueing a job without waiting.
#[derive(Debug, Serialize)]
pub struct SubmittedJob {
    pub job_id: JobId,
    pub status: JobStatus,
    pub message: String,
}

/// Response for querying a job.
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    #[serde(flatten)]
    pub job: JobRecord,
    pub result: Option<DetectionResult>,
}

/// GET /api/v1/jobs/{job_id}: Job record, with its result once completed.
pub async fn get_job_status(
    State(state): State<AppState>,
    job_id: Result<Path<i64>, PathRejection>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let Path(job_id) = job_id.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let job_id = JobId(job_id);
    let job = state
        .store
        .get_job(job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {job_id} not found")))?;

    let result = match job.status {
        JobStatus::Completed => state.store.get_result(job_id).await?,
        _ => None,
    };

    Ok(Json(JobStatusResponse { job, result }))
}
