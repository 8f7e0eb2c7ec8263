//! Wire protocol shared by the submitter and the workers.
//!
//! Both sides run in different processes and never talk to each other
//! directly. They agree on three things only: the shape of a job message,
//! the shape of a result message, and the name of the response slot a
//! result is published to, which is derived from the job id alone.

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::job::JobId;

const SLOT_PREFIX: &str = "result_";

/// Name of the single-use list a result for one job is pushed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotName(String);

impl SlotName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SlotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The only place slot names are formed.
pub fn response_slot(job_id: JobId) -> SlotName {
    SlotName(format!("{SLOT_PREFIX}{}", job_id.get()))
}

/// Optional hints carried alongside the payload. Workers may ignore them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobHints {
    #[serde(default)]
    pub priority: i16,
}

/// Job payload serialized into the work queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMessage {
    pub job_id: JobId,
    /// Base64 encoded image bytes.
    pub image: String,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub hints: JobHints,
}

impl JobMessage {
    /// Build a message for `image`, refusing empty or oversized payloads.
    pub fn new(
        job_id: JobId,
        image: &[u8],
        hints: JobHints,
        max_bytes: usize,
    ) -> Result<Self, ProtocolError> {
        check_payload_len(image.len(), max_bytes)?;
        Ok(Self {
            job_id,
            image: base64::engine::general_purpose::STANDARD.encode(image),
            enqueued_at: Utc::now(),
            hints,
        })
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Serialize)
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(ProtocolError::Deserialize)
    }

    /// Decode the payload, applying the same bound the submitter enforced.
    pub fn image_bytes(&self, max_bytes: usize) -> Result<Vec<u8>, ProtocolError> {
        // base64 expands 3 bytes into 4 characters
        let upper_bound = self.image.len() / 4 * 3;
        if upper_bound > max_bytes + 2 {
            return Err(ProtocolError::PayloadTooLarge {
                size: upper_bound,
                max: max_bytes,
            });
        }

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&self.image)
            .map_err(ProtocolError::Payload)?;
        check_payload_len(bytes.len(), max_bytes)?;
        Ok(bytes)
    }
}

fn check_payload_len(size: usize, max: usize) -> Result<(), ProtocolError> {
    if size == 0 {
        return Err(ProtocolError::EmptyPayload);
    }
    if size > max {
        return Err(ProtocolError::PayloadTooLarge { size, max });
    }
    Ok(())
}

/// Acknowledgement published to a job's response slot.
///
/// Carries only a summary. On success the full result is read back from the
/// job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub job_id: JobId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detections_count: Option<usize>,
}

impl ResultMessage {
    pub fn success(job_id: JobId, processing_time_ms: u64, detections_count: usize) -> Self {
        Self {
            job_id,
            success: true,
            error_message: None,
            processing_time_ms: Some(processing_time_ms),
            detections_count: Some(detections_count),
        }
    }

    pub fn failure(job_id: JobId, error: impl Into<String>) -> Self {
        Self {
            job_id,
            success: false,
            error_message: Some(error.into()),
            processing_time_ms: None,
            detections_count: None,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Serialize)
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(ProtocolError::Deserialize)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Image payload is empty")]
    EmptyPayload,

    #[error("Image payload of {size} bytes exceeds limit of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Invalid image payload encoding: {0}")]
    Payload(#[from] base64::DecodeError),

    #[error("Failed to serialize message: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Malformed message: {0}")]
    Deserialize(#[source] serde_json::Error),
}
