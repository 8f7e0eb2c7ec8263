use std::sync::Arc;
use std::time::Duration;

use crate::db::JobStore;
use crate::services::queue::Broker;
use crate::services::submitter::JobSubmitter;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn Broker>,
    pub submitter: Arc<JobSubmitter>,
    pub default_timeout: Duration,
}

impl AppState {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn Broker>,
        submitter: JobSubmitter,
        default_timeout: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            submitter: Arc::new(submitter),
            default_timeout,
        }
    }

    pub fn max_image_bytes(&self) -> usize {
        self.submitter.config().max_payload_bytes
    }
}
