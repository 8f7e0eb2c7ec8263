use axum::extract::{Multipart, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use garde::Validate;
use serde::Deserialize;
use std::time::Duration;

use crate::app_state::AppState;
use crate::models::detection::DetectionResult;
use crate::models::job::{CallerId, JobStatus};
use crate::routes::error::ApiError;
use crate::routes::jobs::SubmittedJob;

/// Header the identity layer uses to tag requests with the caller.
pub const CALLER_HEADER: &str = "x-caller-id";

#[derive(Debug, Deserialize, Validate)]
pub struct DetectParams {
    /// Seconds to wait for the result.
    #[garde(range(min = 1))]
    pub timeout: Option<u64>,

    /// Milliseconds to wait; takes precedence over `timeout`.
    #[garde(range(min = 1))]
    pub timeout_ms: Option<u64>,
}

impl DetectParams {
    fn timeout(&self, default: Duration) -> Duration {
        match (self.timeout_ms, self.timeout) {
            (Some(ms), _) => Duration::from_millis(ms),
            (None, Some(secs)) => Duration::from_secs(secs),
            (None, None) => default,
        }
    }
}

pub(crate) fn caller_from(headers: &HeaderMap) -> CallerId {
    headers
        .get(CALLER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(CallerId::new)
        .unwrap_or_else(CallerId::anonymous)
}

/// Pull the `image` field out of a multipart upload.
pub(crate) async fn read_image(mut multipart: Multipart) -> Result<Vec<u8>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        if field.name() == Some("image") {
            let data = field
                .bytes()
                .await
                .map_err(|e| ApiError::BadRequest(e.to_string()))?;
            return Ok(data.to_vec());
        }
    }

    Err(ApiError::BadRequest("missing multipart field `image`".to_string()))
}

/// POST /api/v1/detect: Upload an image and wait for its detections.
pub async fn detect_objects(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<DetectParams>,
    multipart: Multipart,
) -> Result<Json<DetectionResult>, ApiError> {
    params
        .validate()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let caller = caller_from(&headers);
    let timeout = params.timeout(state.default_timeout);
    let image = read_image(multipart).await?;

    let result = state.submitter.submit(&image, &caller, timeout).await?;
    Ok(Json(result))
}

/// POST /api/v1/jobs: Upload an image and return immediately with its job id.
pub async fn submit_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<(StatusCode, Json<SubmittedJob>), ApiError> {
    let caller = caller_from(&headers);
    let image = read_image(multipart).await?;

    let job_id = state.submitter.enqueue(&image, &caller).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmittedJob {
            job_id,
            status: JobStatus::Queued,
            message: "Image queued for processing".to_string(),
        }),
    ))
}
