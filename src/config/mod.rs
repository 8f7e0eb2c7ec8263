use serde::Deserialize;
use std::time::Duration;

use crate::services::queue::DEFAULT_QUEUE_KEY;
use crate::services::submitter::SubmitterConfig;
use crate::services::worker::WorkerConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for job queue
    pub redis_url: String,

    /// Redis list holding pending jobs
    #[serde(default = "default_queue_key")]
    pub queue_key: String,

    /// Wait applied when a request does not name one
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    #[serde(default = "default_max_timeout_secs")]
    pub max_timeout_secs: u64,

    /// Largest accepted image, in bytes
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: usize,

    /// Expiry of result slots nobody reads
    #[serde(default = "default_slot_ttl_secs")]
    pub slot_ttl_secs: u64,

    /// Inference server endpoint. Required for worker processes.
    pub inference_url: Option<String>,

    #[serde(default = "default_model_name")]
    pub model_name: String,

    /// Worker loops per worker process
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Prometheus listener for worker processes (e.g., "0.0.0.0:9100")
    pub worker_metrics_addr: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_queue_key() -> String {
    DEFAULT_QUEUE_KEY.to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_timeout_secs() -> u64 {
    300
}

fn default_max_image_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_slot_ttl_secs() -> u64 {
    600
}

fn default_model_name() -> String {
    "yolov8n".to_string()
}

fn default_worker_concurrency() -> usize {
    1
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn submitter(&self) -> SubmitterConfig {
        SubmitterConfig {
            max_payload_bytes: self.max_image_bytes,
            max_timeout: Duration::from_secs(self.max_timeout_secs),
        }
    }

    pub fn worker(&self) -> WorkerConfig {
        WorkerConfig {
            max_payload_bytes: self.max_image_bytes,
            slot_ttl: Duration::from_secs(self.slot_ttl_secs),
            ..WorkerConfig::default()
        }
    }
}
