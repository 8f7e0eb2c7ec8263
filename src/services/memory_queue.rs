//! In-process broker with the same delivery semantics as [`RedisQueue`].
//!
//! Used by the test suites and for running the API and workers inside one
//! process without Redis.
//!
//! [`RedisQueue`]: crate::services::queue::RedisQueue

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::services::protocol::SlotName;
use crate::services::queue::{Broker, QueueError};

#[derive(Default)]
struct Slot {
    messages: VecDeque<String>,
    expires_at: Option<Instant>,
    ready: Arc<Notify>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
pub struct MemoryQueue {
    jobs: Mutex<VecDeque<String>>,
    job_ready: Notify,
    slots: Mutex<HashMap<String, Slot>>,
    closed: AtomicBool,
    published: AtomicU64,
    consumed: AtomicU64,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every blocked popper with [`QueueError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.job_ready.notify_waiters();
    }

    /// Messages sitting unread in `slot`. Expired slots count as empty.
    pub fn slot_len(&self, slot: &SlotName) -> usize {
        let now = Instant::now();
        lock(&self.slots)
            .get(slot.as_str())
            .filter(|s| !s.is_expired(now))
            .map_or(0, |s| s.messages.len())
    }

    /// Total result messages ever published.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    /// Total result messages handed to a waiter.
    pub fn consumed_count(&self) -> u64 {
        self.consumed.load(Ordering::SeqCst)
    }

    fn take_from_slot(&self, name: &str) -> (Option<String>, Arc<Notify>) {
        let mut slots = lock(&self.slots);
        let now = Instant::now();
        if slots.get(name).is_some_and(|s| s.is_expired(now)) {
            slots.remove(name);
        }
        let slot = slots.entry(name.to_string()).or_default();
        let message = slot.messages.pop_back();
        let ready = slot.ready.clone();
        if message.is_some() && slot.messages.is_empty() {
            slots.remove(name);
        }
        (message, ready)
    }

    fn discard_if_empty(&self, name: &str) {
        let mut slots = lock(&self.slots);
        if slots.get(name).is_some_and(|s| s.messages.is_empty()) {
            slots.remove(name);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Broker for MemoryQueue {
    async fn push_job(&self, payload: &str) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        lock(&self.jobs).push_back(payload.to_string());
        self.job_ready.notify_one();
        Ok(())
    }

    async fn pop_job(&self) -> Result<String, QueueError> {
        loop {
            let notified = self.job_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.load(Ordering::SeqCst) {
                return Err(QueueError::Closed);
            }
            if let Some(payload) = lock(&self.jobs).pop_front() {
                return Ok(payload);
            }
            notified.await;
        }
    }

    async fn pop_job_timeout(&self, timeout: Duration) -> Result<Option<String>, QueueError> {
        // The pop takes the message within a single poll, so dropping the
        // wait never loses one.
        match tokio::time::timeout(timeout, self.pop_job()).await {
            Ok(popped) => popped.map(Some),
            Err(_) => Ok(None),
        }
    }

    async fn publish(
        &self,
        slot: &SlotName,
        payload: &str,
        ttl: Duration,
    ) -> Result<(), QueueError> {
        let ready = {
            let mut slots = lock(&self.slots);
            let now = Instant::now();
            slots.retain(|_, s| !s.is_expired(now));
            let entry = slots.entry(slot.as_str().to_string()).or_default();
            entry.messages.push_front(payload.to_string());
            entry.expires_at = Some(now + ttl);
            entry.ready.clone()
        };
        self.published.fetch_add(1, Ordering::SeqCst);
        ready.notify_one();
        Ok(())
    }

    async fn wait_slot(
        &self,
        slot: &SlotName,
        timeout: Duration,
    ) -> Result<Option<String>, QueueError> {
        let wait = async {
            loop {
                let (message, ready) = self.take_from_slot(slot.as_str());
                if let Some(message) = message {
                    return message;
                }
                // notify_one stores a permit, so a publish landing between
                // the check above and this await is not lost.
                ready.notified().await;
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(message) => {
                self.consumed.fetch_add(1, Ordering::SeqCst);
                Ok(Some(message))
            }
            Err(_) => {
                self.discard_if_empty(slot.as_str());
                Ok(None)
            }
        }
    }

    async fn queue_depth(&self) -> Result<u64, QueueError> {
        Ok(lock(&self.jobs).len() as u64)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        Ok(())
    }
}
