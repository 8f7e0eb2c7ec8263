use async_trait::async_trait;
use redis::AsyncCommands;
use std::time::Duration;

use crate::services::protocol::SlotName;

pub const DEFAULT_QUEUE_KEY: &str = "detection_jobs";

/// Extra time granted on top of a slot wait before the runtime cancels it.
const SLOT_WAIT_GRACE: Duration = Duration::from_millis(250);

/// Shared work queue plus per-job response slots.
///
/// Jobs are pushed to the tail and popped from the head, so a single
/// consumer sees them oldest first. Every pushed message is handed to
/// exactly one popper.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Append an encoded job to the tail of the work queue.
    async fn push_job(&self, payload: &str) -> Result<(), QueueError>;

    /// Remove the oldest job, waiting for as long as it takes.
    async fn pop_job(&self) -> Result<String, QueueError>;

    /// Remove the oldest job, waiting at most `timeout` for one to arrive.
    ///
    /// The wait ends on the broker side, so callers can stop between calls
    /// without leaving a pending pop behind that would swallow a later job.
    async fn pop_job_timeout(&self, timeout: Duration) -> Result<Option<String>, QueueError>;

    /// Push the single result message for a job and let it expire after `ttl`.
    async fn publish(&self, slot: &SlotName, payload: &str, ttl: Duration)
        -> Result<(), QueueError>;

    /// Wait up to `timeout` for the result message on `slot`, consuming it.
    async fn wait_slot(
        &self,
        slot: &SlotName,
        timeout: Duration,
    ) -> Result<Option<String>, QueueError>;

    /// Number of jobs waiting to be popped.
    async fn queue_depth(&self) -> Result<u64, QueueError>;

    /// Check broker connectivity (for health checks).
    async fn health_check(&self) -> Result<(), QueueError>;
}

/// Redis-backed job queue. Jobs live in one list, results in `result_<id>` lists.
pub struct RedisQueue {
    client: redis::Client,
    queue_key: String,
}

impl RedisQueue {
    pub fn new(redis_url: &str, queue_key: impl Into<String>) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            queue_key: queue_key.into(),
        })
    }

    // Blocking commands hold a connection until they return, so every call
    // gets its own instead of sharing one across concurrent waiters.
    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }
}

#[async_trait]
impl Broker for RedisQueue {
    async fn push_job(&self, payload: &str) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        conn.lpush::<_, _, ()>(&self.queue_key, payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn pop_job(&self) -> Result<String, QueueError> {
        let mut conn = self.connection().await?;
        loop {
            // A zero timeout blocks until a job arrives.
            let popped: Option<(String, String)> = conn
                .brpop(&self.queue_key, 0.0)
                .await
                .map_err(QueueError::Redis)?;
            if let Some((_, payload)) = popped {
                return Ok(payload);
            }
        }
    }

    async fn pop_job_timeout(&self, timeout: Duration) -> Result<Option<String>, QueueError> {
        let mut conn = self.connection().await?;
        // Never 0 here, which BRPOP reads as "forever".
        let server_timeout = timeout.as_secs_f64().max(0.001);
        let popped: Option<(String, String)> = conn
            .brpop(&self.queue_key, server_timeout)
            .await
            .map_err(QueueError::Redis)?;
        Ok(popped.map(|(_, payload)| payload))
    }

    async fn publish(
        &self,
        slot: &SlotName,
        payload: &str,
        ttl: Duration,
    ) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let ttl_secs = ttl.as_secs().max(1) as i64;
        redis::pipe()
            .atomic()
            .lpush(slot.as_str(), payload)
            .ignore()
            .expire(slot.as_str(), ttl_secs)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn wait_slot(
        &self,
        slot: &SlotName,
        timeout: Duration,
    ) -> Result<Option<String>, QueueError> {
        let mut conn = self.connection().await?;
        // BRPOP treats 0 as "forever", so never send less than a millisecond.
        let server_timeout = timeout.as_secs_f64().max(0.001);

        let wait = conn.brpop::<_, Option<(String, String)>>(slot.as_str(), server_timeout);
        match tokio::time::timeout(timeout + SLOT_WAIT_GRACE, wait).await {
            Ok(Ok(popped)) => Ok(popped.map(|(_, payload)| payload)),
            Ok(Err(e)) => Err(QueueError::Redis(e)),
            Err(_) => Ok(None),
        }
    }

    async fn queue_depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let depth: u64 = conn.llen(&self.queue_key).await.map_err(QueueError::Redis)?;
        Ok(depth)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Broker closed")]
    Closed,
}
