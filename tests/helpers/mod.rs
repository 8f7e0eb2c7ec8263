//! Test helper utilities for dispatch testing

#![allow(dead_code)]

use async_trait::async_trait;
use detection_dispatch::{
    db::{JobStore, MemoryJobStore},
    models::detection::BoundingBox,
    models::job::{JobId, JobStatus},
    services::{
        inference::{Detector, Inference, InferenceError},
        memory_queue::MemoryQueue,
        protocol::SlotName,
        queue::{Broker, QueueError},
        submitter::{JobSubmitter, SubmitterConfig},
        worker::{WorkerConfig, WorkerLoop},
    },
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// What the scripted engine does for one call.
#[derive(Debug, Clone)]
pub enum Step {
    Detect { delay: Duration, boxes: usize },
    Fail { delay: Duration, message: String },
}

type Script = dyn Fn(usize, &[u8]) -> Step + Send + Sync;

/// Detector whose behaviour is decided per call by a closure receiving the
/// call index and the payload.
pub struct ScriptedDetector {
    script: Box<Script>,
    calls: AtomicUsize,
}

impl ScriptedDetector {
    pub fn new(script: impl Fn(usize, &[u8]) -> Step + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            calls: AtomicUsize::new(0),
        }
    }

    /// Always return `boxes` detections after `delay`.
    pub fn fixed(delay: Duration, boxes: usize) -> Self {
        Self::new(move |_, _| Step::Detect { delay, boxes })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Detector for ScriptedDetector {
    fn model_name(&self) -> &str {
        "scripted"
    }

    fn detect(&self, image: &[u8]) -> Result<Inference, InferenceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        match (self.script)(call, image) {
            Step::Detect { delay, boxes } => {
                std::thread::sleep(delay);
                Ok(Inference {
                    image_width: 640,
                    image_height: 480,
                    boxes: (0..boxes).map(sample_box).collect(),
                })
            }
            Step::Fail { delay, message } => {
                std::thread::sleep(delay);
                Err(InferenceError::Engine(message))
            }
        }
    }
}

pub fn sample_box(n: usize) -> BoundingBox {
    let offset = n as f64 * 10.0;
    BoundingBox {
        class_name: format!("class_{n}"),
        confidence: (0.9 - n as f64 * 0.05).max(0.1),
        x1: offset,
        y1: offset,
        x2: offset + 50.0,
        y2: offset + 80.0,
    }
}

/// In-memory deployment: one store, one broker, a submitter and any number
/// of worker loops.
pub struct Harness {
    pub store: Arc<MemoryJobStore>,
    pub queue: Arc<MemoryQueue>,
    pub submitter: Arc<JobSubmitter>,
    pub worker_config: WorkerConfig,
    workers: Vec<JoinHandle<()>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_slot_ttl(Duration::from_secs(60))
    }

    pub fn with_slot_ttl(slot_ttl: Duration) -> Self {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let submitter = Arc::new(JobSubmitter::new(
            store.clone(),
            queue.clone(),
            SubmitterConfig::default(),
        ));
        Self {
            store,
            queue,
            submitter,
            worker_config: WorkerConfig {
                slot_ttl,
                error_backoff: Duration::from_millis(10),
                ..WorkerConfig::default()
            },
            workers: Vec::new(),
        }
    }

    pub fn spawn_workers(&mut self, count: usize, detector: Arc<dyn Detector>) {
        self.spawn_workers_on(self.queue.clone(), count, detector);
    }

    /// Spawn workers that reach the queue through `broker` instead.
    pub fn spawn_workers_on(
        &mut self,
        broker: Arc<dyn Broker>,
        count: usize,
        detector: Arc<dyn Detector>,
    ) {
        for _ in 0..count {
            let worker = WorkerLoop::new(
                broker.clone(),
                self.store.clone(),
                detector.clone(),
                self.worker_config.clone(),
            );
            self.workers.push(tokio::spawn(async move { worker.run().await }));
        }
    }

    /// Wait until the job reaches a terminal status, or panic after `limit`.
    pub async fn wait_terminal(&self, job_id: JobId, limit: Duration) -> JobStatus {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let record = self.store.get_job(job_id).await.unwrap().unwrap();
            if record.status.is_terminal() {
                return record.status;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {job_id} still {} after {limit:?}",
                record.status
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.queue.close();
        for worker in &self.workers {
            worker.abort();
        }
    }
}

fn connection_reset() -> QueueError {
    QueueError::Redis(redis::RedisError::from((
        redis::ErrorKind::IoError,
        "connection reset",
    )))
}

/// Broker in front of a [`MemoryQueue`] that fails on demand with the kind
/// of error a dropped Redis connection produces.
pub struct FlakyBroker {
    inner: Arc<MemoryQueue>,
    pop_failures: AtomicUsize,
    fail_waits: AtomicBool,
}

impl FlakyBroker {
    pub fn new(inner: Arc<MemoryQueue>) -> Self {
        Self {
            inner,
            pop_failures: AtomicUsize::new(0),
            fail_waits: AtomicBool::new(false),
        }
    }

    /// Fail the next `n` pops.
    pub fn fail_pops(&self, n: usize) {
        self.pop_failures.store(n, Ordering::SeqCst);
    }

    pub fn pop_failures_left(&self) -> usize {
        self.pop_failures.load(Ordering::SeqCst)
    }

    /// Fail every slot wait while set.
    pub fn fail_waits(&self, on: bool) {
        self.fail_waits.store(on, Ordering::SeqCst);
    }

    fn take_pop_failure(&self) -> bool {
        self.pop_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Broker for FlakyBroker {
    async fn push_job(&self, payload: &str) -> Result<(), QueueError> {
        self.inner.push_job(payload).await
    }

    async fn pop_job(&self) -> Result<String, QueueError> {
        if self.take_pop_failure() {
            return Err(connection_reset());
        }
        self.inner.pop_job().await
    }

    async fn pop_job_timeout(&self, timeout: Duration) -> Result<Option<String>, QueueError> {
        if self.take_pop_failure() {
            return Err(connection_reset());
        }
        self.inner.pop_job_timeout(timeout).await
    }

    async fn publish(&self, slot: &SlotName, payload: &str, ttl: Duration) -> Result<(), QueueError> {
        self.inner.publish(slot, payload, ttl).await
    }

    async fn wait_slot(
        &self,
        slot: &SlotName,
        timeout: Duration,
    ) -> Result<Option<String>, QueueError> {
        if self.fail_waits.load(Ordering::SeqCst) {
            return Err(connection_reset());
        }
        self.inner.wait_slot(slot, timeout).await
    }

    async fn queue_depth(&self) -> Result<u64, QueueError> {
        self.inner.queue_depth().await
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        self.inner.health_check().await
    }
}

/// A payload of `len` bytes whose content varies with `seed`.
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}
