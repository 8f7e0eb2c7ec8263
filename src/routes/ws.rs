use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::app_state::AppState;
use crate::models::detection::DetectionResult;
use crate::models::job::{CallerId, JobId};
use crate::routes::detect::caller_from;
use crate::routes::error::ApiError;
use crate::services::submitter::SubmitError;

/// Text frame sent by the client: a base64 image and an optional wait.
#[derive(Debug, Deserialize)]
pub struct DetectFrame {
    pub image: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Frame sent back to the client. Every submission gets a `queued` frame
/// followed by exactly one of the others.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DetectEvent {
    Queued {
        job_id: JobId,
        message: String,
    },
    Completed {
        job_id: JobId,
        detection: DetectionResult,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        job_id: Option<JobId>,
        #[serde(rename = "type")]
        error_type: &'static str,
        error: String,
    },
    Timeout {
        job_id: JobId,
        error: String,
    },
}

impl DetectEvent {
    fn invalid(error: impl Into<String>) -> Self {
        DetectEvent::Error {
            job_id: None,
            error_type: "invalid_request",
            error: error.into(),
        }
    }
}

impl From<SubmitError> for DetectEvent {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::Timeout { job_id, .. } => DetectEvent::Timeout {
                job_id,
                error: "Detection timed out".to_string(),
            },
            err => {
                let err = ApiError::from(err);
                DetectEvent::Error {
                    job_id: err.job_id(),
                    error_type: err.status_and_type().1,
                    error: err.to_string(),
                }
            }
        }
    }
}

/// GET /ws/detect: Submit images over a WebSocket and receive each result on
/// the same connection.
pub async fn ws_detect(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let caller = caller_from(&headers);
    // Base64 grows the payload by a third.
    let max_frame = state.max_image_bytes() / 3 * 4 + 1024;
    ws.max_message_size(max_frame)
        .on_upgrade(move |socket| handle_socket(socket, state, caller))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, caller: CallerId) {
    tracing::info!(caller = %caller, "WebSocket connected");

    while let Some(frame) = socket.recv().await {
        let submission = match frame {
            Ok(Message::Text(text)) => parse_frame(text.as_str(), state.default_timeout),
            Ok(Message::Binary(bytes)) => Ok((bytes.to_vec(), state.default_timeout)),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(caller = %caller, error = %e, "WebSocket receive error");
                break;
            }
        };

        let open = match submission {
            Ok((image, timeout)) => detect(&mut socket, &state, &caller, &image, timeout).await,
            Err(event) => send(&mut socket, &event).await,
        };
        if !open {
            break;
        }
    }

    tracing::info!(caller = %caller, "WebSocket disconnected");
}

fn parse_frame(text: &str, default_timeout: Duration) -> Result<(Vec<u8>, Duration), DetectEvent> {
    let frame: DetectFrame = serde_json::from_str(text)
        .map_err(|e| DetectEvent::invalid(format!("invalid frame: {e}")))?;
    let image = base64::engine::general_purpose::STANDARD
        .decode(frame.image.as_bytes())
        .map_err(|e| DetectEvent::invalid(format!("image is not valid base64: {e}")))?;
    let timeout = frame
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(default_timeout);
    Ok((image, timeout))
}

/// Run one submission on the socket. Returns false once the client is gone.
async fn detect(
    socket: &mut WebSocket,
    state: &AppState,
    caller: &CallerId,
    image: &[u8],
    timeout: Duration,
) -> bool {
    let submitter = &state.submitter;
    if let Err(e) = submitter.check_timeout(timeout) {
        return send(socket, &DetectEvent::from(e)).await;
    }

    let job_id = match submitter.enqueue(image, caller).await {
        Ok(job_id) => job_id,
        Err(e) => return send(socket, &DetectEvent::from(e)).await,
    };
    let queued = DetectEvent::Queued {
        job_id,
        message: "Image queued for processing".to_string(),
    };
    if !send(socket, &queued).await {
        return false;
    }

    let event = match submitter.await_result(job_id, timeout).await {
        Ok(detection) => DetectEvent::Completed { job_id, detection },
        Err(e) => DetectEvent::from(e),
    };
    send(socket, &event).await
}

async fn send(socket: &mut WebSocket, event: &DetectEvent) -> bool {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode WebSocket event");
            return true;
        }
    };
    socket.send(Message::Text(text.into())).await.is_ok()
}
