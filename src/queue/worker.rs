//! Worker pools: reserve a job, run its handler, acknowledge the outcome.
//!
//! The handler never touches the queue. Its `Result` decides the ack:
//! - `Ok` → complete
//! - `Retryable` → retry after backoff, or dead-letter once attempts run out
//! - `Permanent` → dead-letter
//!
//! A handler that overruns `job_timeout` or panics counts as retryable.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::WorkerPoolConfig;
use crate::error::{JobError, QueueError};
use crate::queue::{JobQueue, QueueJob, QueuedJob};

/// Consumer for one job type.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    type Job: QueueJob;

    async fn handle(&self, job: Self::Job) -> Result<(), JobError>;
}

/// What a single poll did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing was ready.
    Idle,
    Completed,
    Retried,
    DeadLettered,
}

/// A fixed-size pool of workers draining one queue.
pub struct WorkerPool<H: JobHandler> {
    queue: Arc<dyn JobQueue>,
    handler: Arc<H>,
    config: WorkerPoolConfig,
}

impl<H: JobHandler> WorkerPool<H> {
    pub fn new(queue: Arc<dyn JobQueue>, handler: Arc<H>, config: WorkerPoolConfig) -> Self {
        Self {
            queue,
            handler,
            config,
        }
    }

    /// Reserve and run at most one job.
    pub async fn poll_once(&self) -> Result<PollOutcome, QueueError> {
        let queue_name = H::Job::QUEUE;
        let Some(job) = self.queue.reserve(queue_name, self.config.lease).await? else {
            return Ok(PollOutcome::Idle);
        };

        // Redeliveries after crashes also count against the budget.
        if job.attempts > self.config.retry.max_attempts {
            let reason = format!("gave up after {} deliveries", job.attempts - 1);
            error!(queue = %queue_name, job_id = %job.id, attempts = job.attempts, "Job exhausted its attempts, dead-lettering");
            self.queue.fail(job.id, &reason).await?;
            return Ok(PollOutcome::DeadLettered);
        }

        let typed: H::Job = match serde_json::from_value(job.payload.clone()) {
            Ok(typed) => typed,
            Err(e) => {
                error!(queue = %queue_name, job_id = %job.id, error = %e, "Invalid job payload, dead-lettering");
                self.queue
                    .fail(job.id, &format!("invalid payload: {e}"))
                    .await?;
                return Ok(PollOutcome::DeadLettered);
            }
        };

        debug!(queue = %queue_name, job_id = %job.id, attempt = job.attempts, "Running job");
        let result = self.run_handler(typed).await;
        self.acknowledge(&job, result).await
    }

    /// Run the handler on its own task so a panic or overrun cannot take
    /// the worker down with it.
    async fn run_handler(&self, job: H::Job) -> Result<(), JobError> {
        let handler = Arc::clone(&self.handler);
        let mut task = tokio::spawn(async move { handler.handle(job).await });

        match tokio::time::timeout(self.config.job_timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(JobError::Retryable(format!("handler panicked: {join_err}"))),
            Err(_) => {
                task.abort();
                Err(JobError::Retryable(format!(
                    "handler timed out after {:?}",
                    self.config.job_timeout
                )))
            }
        }
    }

    async fn acknowledge(
        &self,
        job: &QueuedJob,
        result: Result<(), JobError>,
    ) -> Result<PollOutcome, QueueError> {
        let queue_name = job.queue;
        match result {
            Ok(()) => {
                self.queue.complete(job.id).await?;
                debug!(queue = %queue_name, job_id = %job.id, "Job completed");
                Ok(PollOutcome::Completed)
            }
            Err(JobError::Retryable(reason)) if self.config.retry.should_retry(job.attempts) => {
                let delay = self.config.retry.delay_for(job.attempts);
                warn!(
                    queue = %queue_name,
                    job_id = %job.id,
                    attempt = job.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    "Job failed, will retry"
                );
                self.queue.retry(job.id, delay, &reason).await?;
                Ok(PollOutcome::Retried)
            }
            Err(e) => {
                error!(queue = %queue_name, job_id = %job.id, attempt = job.attempts, error = %e, "Job failed permanently");
                self.queue.fail(job.id, &e.to_string()).await?;
                Ok(PollOutcome::DeadLettered)
            }
        }
    }

    /// Spawn `config.workers` worker tasks under one supervisor.
    ///
    /// Setting the returned flag stops each worker after its current job.
    pub fn spawn(self: Arc<Self>) -> (JoinHandle<()>, Arc<AtomicBool>) {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = Arc::clone(&shutdown);
        let queue_name = H::Job::QUEUE;
        let workers = self.config.workers;

        let handle = tokio::spawn(async move {
            info!(queue = %queue_name, workers, "Worker pool started");
            let tasks: Vec<_> = (0..workers)
                .map(|worker| {
                    let pool = Arc::clone(&self);
                    let shutdown = Arc::clone(&shutdown);
                    tokio::spawn(async move { pool.work(worker, shutdown).await })
                })
                .collect();

            for result in futures::future::join_all(tasks).await {
                if let Err(e) = result {
                    error!(queue = %queue_name, error = %e, "Worker task aborted");
                }
            }
            info!(queue = %queue_name, "Worker pool stopped");
        });

        (handle, shutdown_flag)
    }

    async fn work(&self, worker: usize, shutdown: Arc<AtomicBool>) {
        let queue_name = H::Job::QUEUE;
        loop {
            if shutdown.load(Ordering::Relaxed) {
                debug!(queue = %queue_name, worker, "Worker shutting down");
                return;
            }

            match self.poll_once().await {
                Ok(PollOutcome::Idle) => tokio::time::sleep(self.config.poll_interval).await,
                Ok(_) => {}
                Err(e) => {
                    error!(queue = %queue_name, worker, error = %e, "Queue unavailable");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use super::*;
    use crate::config::RetryPolicy;
    use crate::queue::store::{JobStatus, LibSqlQueue};
    use crate::queue::{QueueName, TypedQueue};

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    impl QueueJob for Ping {
        const QUEUE: QueueName = QueueName::Reply;
    }

    #[derive(Clone, Copy)]
    enum Behavior {
        Succeed,
        Transient,
        Permanent,
        Hang,
        Panic,
    }

    struct ScriptedHandler {
        behavior: Behavior,
        calls: AtomicU32,
        seen: Mutex<Vec<u32>>,
    }

    impl ScriptedHandler {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                calls: AtomicU32::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl JobHandler for ScriptedHandler {
        type Job = Ping;

        async fn handle(&self, job: Ping) -> Result<(), JobError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(job.n);
            match self.behavior {
                Behavior::Succeed => Ok(()),
                Behavior::Transient => Err(JobError::Retryable("connection reset".into())),
                Behavior::Permanent => Err(JobError::Permanent("token rejected".into())),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                }
                Behavior::Panic => panic!("boom"),
            }
        }
    }

    fn config(max_attempts: u32) -> WorkerPoolConfig {
        WorkerPoolConfig {
            workers: 2,
            poll_interval: Duration::from_millis(5),
            lease: Duration::from_secs(60),
            job_timeout: Duration::from_millis(100),
            retry: RetryPolicy {
                max_attempts,
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
                jitter: false,
            },
        }
    }

    async fn setup(
        behavior: Behavior,
        max_attempts: u32,
    ) -> (
        Arc<LibSqlQueue>,
        TypedQueue<Ping>,
        Arc<ScriptedHandler>,
        Arc<WorkerPool<ScriptedHandler>>,
    ) {
        let store = Arc::new(LibSqlQueue::new_memory().await.unwrap());
        let queue: Arc<dyn JobQueue> = store.clone();
        let handler = ScriptedHandler::new(behavior);
        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&queue),
            Arc::clone(&handler),
            config(max_attempts),
        ));
        (store, TypedQueue::new(queue), handler, pool)
    }

    #[tokio::test]
    async fn success_completes_job() {
        let (store, typed, handler, pool) = setup(Behavior::Succeed, 3).await;
        let id = typed.push(&Ping { n: 7 }).await.unwrap().unwrap();

        assert_eq!(pool.poll_once().await.unwrap(), PollOutcome::Completed);
        assert_eq!(pool.poll_once().await.unwrap(), PollOutcome::Idle);
        assert_eq!(*handler.seen.lock().unwrap(), vec![7]);
        assert_eq!(store.get(id).await.unwrap().unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn transient_failure_retries_until_exhausted() {
        let (store, typed, handler, pool) = setup(Behavior::Transient, 3).await;
        let id = typed.push(&Ping { n: 1 }).await.unwrap().unwrap();

        assert_eq!(pool.poll_once().await.unwrap(), PollOutcome::Retried);
        assert_eq!(pool.poll_once().await.unwrap(), PollOutcome::Retried);
        assert_eq!(pool.poll_once().await.unwrap(), PollOutcome::DeadLettered);
        assert_eq!(pool.poll_once().await.unwrap(), PollOutcome::Idle);

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.attempts, 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let (store, typed, handler, pool) = setup(Behavior::Permanent, 5).await;
        let id = typed.push(&Ping { n: 1 }).await.unwrap().unwrap();

        assert_eq!(pool.poll_once().await.unwrap(), PollOutcome::DeadLettered);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        let record = store.get(id).await.unwrap().unwrap();
        assert!(record.last_error.unwrap().contains("token rejected"));
    }

    #[tokio::test]
    async fn invalid_payload_skips_handler() {
        let (store, _typed, handler, pool) = setup(Behavior::Succeed, 5).await;
        let id = store
            .enqueue(QueueName::Reply, json!({ "unexpected": true }), None)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(pool.poll_once().await.unwrap(), PollOutcome::DeadLettered);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.get(id).await.unwrap().unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn overrunning_handler_is_retried() {
        let (_store, typed, _handler, pool) = setup(Behavior::Hang, 3).await;
        typed.push(&Ping { n: 1 }).await.unwrap();
        assert_eq!(pool.poll_once().await.unwrap(), PollOutcome::Retried);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_kill_worker() {
        let (_store, typed, _handler, pool) = setup(Behavior::Panic, 3).await;
        typed.push(&Ping { n: 1 }).await.unwrap();
        assert_eq!(pool.poll_once().await.unwrap(), PollOutcome::Retried);
    }

    #[tokio::test]
    async fn crash_looping_job_is_dead_lettered_on_redelivery() {
        let (store, typed, handler, pool) = setup(Behavior::Succeed, 2).await;
        let id = typed.push(&Ping { n: 1 }).await.unwrap().unwrap();

        // Two deliveries whose workers "died" before acking.
        for _ in 0..2 {
            store.reserve(QueueName::Reply, Duration::ZERO).await.unwrap();
        }

        assert_eq!(pool.poll_once().await.unwrap(), PollOutcome::DeadLettered);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.get(id).await.unwrap().unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn spawned_pool_drains_queue_and_stops() {
        let (store, typed, handler, pool) = setup(Behavior::Succeed, 3).await;
        for n in 0..5 {
            typed.push(&Ping { n }).await.unwrap();
        }

        let (handle, shutdown) = pool.spawn();
        for _ in 0..200 {
            if store.counts(QueueName::Reply).await.unwrap().completed == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.store(true, Ordering::Relaxed);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 5);
        let mut seen = handler.seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }
}
