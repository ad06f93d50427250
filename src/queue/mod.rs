//! Durable job queues.
//!
//! Two named queues share one table:
//! - `process`: "process this mailbox" jobs, produced by the trigger
//! - `reply`: "send one reply" jobs, produced by the Outlook fetch path
//!
//! Delivery is at-least-once. A reserved job is leased; if the worker dies
//! before acknowledging it, the lease expires and the job is redelivered.

pub mod store;
mod migrations;
pub mod trigger;
pub mod worker;

pub use store::LibSqlQueue;
pub use trigger::{Trigger, spawn_cron_trigger};
pub use worker::{JobHandler, WorkerPool};

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::error::QueueError;

/// Named queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    Process,
    Reply,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Process => "process",
            Self::Reply => "reply",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job type bound to one queue.
pub trait QueueJob: Serialize + DeserializeOwned + Send + Sync + 'static {
    const QUEUE: QueueName;

    /// While a job with the same key is pending or running, enqueueing
    /// another one is a no-op.
    fn dedupe_key(&self) -> Option<String> {
        None
    }
}

/// A reserved job as handed to a worker.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: Uuid,
    pub queue: QueueName,
    pub payload: serde_json::Value,
    /// Deliveries so far, including this one.
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// Per-status job counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Queue storage backend.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job. Returns `None` when an outstanding job has the same dedupe key.
    async fn enqueue(
        &self,
        queue: QueueName,
        payload: serde_json::Value,
        dedupe_key: Option<&str>,
    ) -> Result<Option<Uuid>, QueueError>;

    /// Lease the oldest ready job, if any.
    async fn reserve(&self, queue: QueueName, lease: Duration)
    -> Result<Option<QueuedJob>, QueueError>;

    /// Acknowledge success.
    async fn complete(&self, id: Uuid) -> Result<(), QueueError>;

    /// Release the job for another delivery after `delay`.
    async fn retry(&self, id: Uuid, delay: Duration, error: &str) -> Result<(), QueueError>;

    /// Dead-letter the job.
    async fn fail(&self, id: Uuid, error: &str) -> Result<(), QueueError>;

    /// Job counts by status.
    async fn counts(&self, queue: QueueName) -> Result<QueueCounts, QueueError>;
}

/// Typed enqueue handle for one job type.
pub struct TypedQueue<J: QueueJob> {
    inner: Arc<dyn JobQueue>,
    _job: PhantomData<fn() -> J>,
}

impl<J: QueueJob> Clone for TypedQueue<J> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _job: PhantomData,
        }
    }
}

impl<J: QueueJob> TypedQueue<J> {
    pub fn new(inner: Arc<dyn JobQueue>) -> Self {
        Self {
            inner,
            _job: PhantomData,
        }
    }

    /// Serialize and enqueue a job. `None` means it was deduplicated.
    pub async fn push(&self, job: &J) -> Result<Option<Uuid>, QueueError> {
        let payload = serde_json::to_value(job).map_err(|e| QueueError::InvalidPayload {
            queue: J::QUEUE.to_string(),
            reason: e.to_string(),
        })?;
        let key = job.dedupe_key();
        self.inner.enqueue(J::QUEUE, payload, key.as_deref()).await
    }

    pub async fn counts(&self) -> Result<QueueCounts, QueueError> {
        self.inner.counts(J::QUEUE).await
    }
}
