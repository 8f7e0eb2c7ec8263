use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::models::job::JobId;

/// One detected object, in pixel coordinates of the source image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct BoundingBox {
    #[garde(length(min = 1, max = 200))]
    pub class_name: String,

    #[garde(range(min = 0.0, max = 1.0))]
    pub confidence: f64,

    #[garde(skip)]
    pub x1: f64,
    #[garde(skip)]
    pub y1: f64,
    #[garde(skip)]
    pub x2: f64,
    #[garde(skip)]
    pub y2: f64,
}

impl BoundingBox {
    /// Corners must be ordered top-left to bottom-right.
    pub fn is_well_formed(&self) -> bool {
        self.x2 >= self.x1 && self.y2 >= self.y1
    }
}

/// Persisted outcome of a successfully processed job. At most one per job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub job_id: JobId,
    pub model_name: String,
    pub image_width: u32,
    pub image_height: u32,
    /// SHA-256 of the raw image bytes, hex encoded.
    pub image_hash: String,
    pub processing_time_ms: u64,
    /// Kept in the order the engine produced them.
    pub boxes: Vec<BoundingBox>,
}

impl DetectionResult {
    pub fn detections_count(&self) -> usize {
        self.boxes.len()
    }
}
