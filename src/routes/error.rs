use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::db::StoreError;
use crate::models::job::JobId;
use crate::services::submitter::SubmitError;

/// Error returned by API handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    pub(crate) fn status_and_type(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Store(_) => (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable"),
            ApiError::Submit(e) => match e {
                SubmitError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
                SubmitError::Timeout { .. } => (StatusCode::REQUEST_TIMEOUT, "timeout"),
                SubmitError::JobFailed { .. } => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "detection_failed")
                }
                SubmitError::Store(_) => (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable"),
                SubmitError::Enqueue { .. } => {
                    (StatusCode::SERVICE_UNAVAILABLE, "queue_unavailable")
                }
                SubmitError::Wait { .. } => (StatusCode::BAD_GATEWAY, "queue_error"),
                SubmitError::MissingResult(_)
                | SubmitError::Mismatch { .. }
                | SubmitError::Protocol(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
                }
            },
        }
    }

    pub(crate) fn job_id(&self) -> Option<JobId> {
        match self {
            ApiError::Submit(e) => e.job_id(),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.status_and_type();
        if status.is_server_error() {
            tracing::error!(status = %status.as_u16(), error = %self, "Request failed");
        }

        let body = Json(json!({
            "error": {
                "type": error_type,
                "message": self.to_string(),
                "job_id": self.job_id(),
            }
        }));

        (status, body).into_response()
    }
}
