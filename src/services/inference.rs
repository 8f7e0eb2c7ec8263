use garde::Validate;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::Deserialize;
use std::io::Cursor;
use tokio::runtime::Handle;

use crate::models::detection::BoundingBox;

/// Output of one inference call.
#[derive(Debug, Clone, PartialEq)]
pub struct Inference {
    pub image_width: u32,
    pub image_height: u32,
    pub boxes: Vec<BoundingBox>,
}

impl Inference {
    /// Reject engine output that would violate the result invariants.
    pub fn validate(&self) -> Result<(), InferenceError> {
        for (idx, bbox) in self.boxes.iter().enumerate() {
            bbox.validate()
                .map_err(|e| InferenceError::InvalidOutput(format!("box {idx}: {e}")))?;
            if !bbox.is_well_formed() {
                return Err(InferenceError::InvalidOutput(format!(
                    "box {idx}: corners out of order"
                )));
            }
        }
        Ok(())
    }
}

/// An object detection engine.
///
/// Calls are synchronous and may take a long time; callers run them on a
/// blocking thread. Implementations are constructed explicitly and handed to
/// the worker loop.
pub trait Detector: Send + Sync {
    fn model_name(&self) -> &str;

    fn detect(&self, image: &[u8]) -> Result<Inference, InferenceError>;
}

/// Read the image dimensions from its header without decoding pixels.
pub fn image_dimensions(image: &[u8]) -> Result<(u32, u32), InferenceError> {
    image::ImageReader::new(Cursor::new(image))
        .with_guessed_format()
        .map_err(|e| InferenceError::Decode(e.to_string()))?
        .into_dimensions()
        .map_err(|e| InferenceError::Decode(e.to_string()))
}

#[derive(Deserialize)]
struct DetectResponse {
    detections: Vec<BoundingBox>,
}

/// Client for a remote inference server.
///
/// The server receives the raw image bytes and answers with
/// `{"detections": [{class_name, confidence, x1, y1, x2, y2}, ...]}`.
pub struct HttpDetector {
    http: Client,
    endpoint: String,
    model_name: String,
    runtime: Handle,
}

impl HttpDetector {
    /// `runtime` drives the HTTP calls; `detect` must then be called from a
    /// thread outside that runtime's async context (e.g. `spawn_blocking`).
    pub fn new(endpoint: impl Into<String>, model_name: impl Into<String>, runtime: Handle) -> Self {
        Self {
            http: Client::new(),
            endpoint: endpoint.into(),
            model_name: model_name.into(),
            runtime,
        }
    }

    async fn request(&self, image: &[u8]) -> Result<DetectResponse, InferenceError> {
        let response = self
            .http
            .post(&self.endpoint)
            .query(&[("model", self.model_name.as_str())])
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(image.to_vec())
            .send()
            .await
            .map_err(InferenceError::Http)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::Engine(format!(
                "inference server returned {status}: {body}"
            )));
        }

        response.json().await.map_err(InferenceError::Http)
    }
}

impl Detector for HttpDetector {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn detect(&self, image: &[u8]) -> Result<Inference, InferenceError> {
        let (image_width, image_height) = image_dimensions(image)?;
        let response = self.runtime.block_on(self.request(image))?;

        Ok(Inference {
            image_width,
            image_height,
            boxes: response.detections,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Cannot decode image: {0}")]
    Decode(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Inference failed: {0}")]
    Engine(String),

    #[error("Invalid detection output: {0}")]
    InvalidOutput(String),
}
