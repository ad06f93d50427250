//! libSQL-backed job queue.
//!
//! All jobs live in one `jobs` table keyed by queue name. Reserving a job is
//! a single `UPDATE ... RETURNING` so two workers can never lease the same
//! row. Timestamps are unix milliseconds.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DatabaseError, QueueError};
use crate::queue::migrations;
use crate::queue::{JobQueue, QueueCounts, QueueName, QueuedJob};

/// Lifecycle of a stored job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// A stored job row, for inspection.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: Uuid,
    pub queue: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub payload: serde_json::Value,
}

/// Durable queue on a local libSQL database.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlQueue {
    /// Keeps the database open for as long as `conn` is in use.
    _db: LibSqlDatabase,
    conn: Connection,
}

impl LibSqlQueue {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let queue = Self::from_database(db).await?;
        info!(path = %path.display(), "Job queue opened");
        Ok(queue)
    }

    /// Create an in-memory queue (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self { _db: db, conn })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Look up a job by id.
    pub async fn get(&self, id: Uuid) -> Result<Option<JobRecord>, QueueError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, queue, status, attempts, last_error, payload FROM jobs WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get job: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get job: {e}")))?
        else {
            return Ok(None);
        };

        let payload: String = row
            .get(5)
            .map_err(|e| DatabaseError::Query(format!("get job payload: {e}")))?;
        Ok(Some(JobRecord {
            id,
            queue: row.get::<String>(1).unwrap_or_default(),
            status: JobStatus::parse(&row.get::<String>(2).unwrap_or_default()),
            attempts: row.get::<i64>(3).unwrap_or(0) as u32,
            last_error: row.get::<String>(4).ok(),
            payload: serde_json::from_str(&payload)
                .map_err(|e| DatabaseError::Serialization(format!("job payload: {e}")))?,
        }))
    }

    /// Delete finished jobs last touched more than `keep` ago.
    pub async fn prune_finished(&self, keep: Duration) -> Result<usize, QueueError> {
        let cutoff = now_ms() - keep.as_millis() as i64;
        let count = self
            .conn()
            .execute(
                "DELETE FROM jobs WHERE status IN ('completed', 'failed') AND updated_at < ?1",
                params![cutoff],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("prune_finished: {e}")))?;

        if count > 0 {
            info!(count, keep_secs = keep.as_secs(), "Pruned finished jobs");
        }
        Ok(count as usize)
    }

    async fn set_finished(
        &self,
        id: Uuid,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<(), QueueError> {
        let count = self
            .conn()
            .execute(
                "UPDATE jobs SET status = ?1, leased_until = NULL, last_error = COALESCE(?2, last_error), updated_at = ?3 WHERE id = ?4",
                params![status.as_str(), error, now_ms(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("finish job: {e}")))?;

        if count == 0 {
            return Err(QueueError::NotFound { id });
        }
        Ok(())
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[async_trait]
impl JobQueue for LibSqlQueue {
    async fn enqueue(
        &self,
        queue: QueueName,
        payload: serde_json::Value,
        dedupe_key: Option<&str>,
    ) -> Result<Option<Uuid>, QueueError> {
        let id = Uuid::new_v4();
        let payload = serde_json::to_string(&payload)
            .map_err(|e| DatabaseError::Serialization(format!("job payload: {e}")))?;
        let now = now_ms();

        // The partial unique index on (queue, dedupe_key) turns a duplicate
        // into an ignored insert.
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO jobs (id, queue, payload, dedupe_key, status, attempts, available_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?5, ?5)",
                params![id.to_string(), queue.as_str(), payload, dedupe_key, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("enqueue: {e}")))?;

        if inserted == 0 {
            debug!(%queue, dedupe_key, "Job already outstanding, skipped");
            return Ok(None);
        }
        debug!(%queue, job_id = %id, "Job enqueued");
        Ok(Some(id))
    }

    async fn reserve(
        &self,
        queue: QueueName,
        lease: Duration,
    ) -> Result<Option<QueuedJob>, QueueError> {
        let now = now_ms();
        let leased_until = now + lease.as_millis() as i64;

        // Pending jobs whose backoff has elapsed, or running jobs whose
        // lease expired (worker died without acknowledging).
        let mut rows = self
            .conn()
            .query(
                "UPDATE jobs
                 SET status = 'running', attempts = attempts + 1, leased_until = ?1, updated_at = ?2
                 WHERE seq = (
                     SELECT seq FROM jobs
                     WHERE queue = ?3
                       AND ((status = 'pending' AND available_at <= ?2)
                         OR (status = 'running' AND leased_until <= ?2))
                     ORDER BY seq ASC
                     LIMIT 1
                 )
                 RETURNING id, payload, attempts, created_at",
                params![leased_until, now, queue.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reserve: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("reserve: {e}")))?
        else {
            return Ok(None);
        };

        let id_str: String = row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("reserve id: {e}")))?;
        let id = Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("job id {id_str}: {e}")))?;
        let payload_str: String = row
            .get(1)
            .map_err(|e| DatabaseError::Query(format!("reserve payload: {e}")))?;
        let attempts = row.get::<i64>(2).unwrap_or(1) as u32;
        let created_at = row.get::<i64>(3).unwrap_or(0);

        // A row we cannot decode still gets handed out; the worker
        // dead-letters it as an invalid payload.
        let payload = serde_json::from_str(&payload_str).unwrap_or_else(|e| {
            warn!(job_id = %id, error = %e, "Stored payload is not valid JSON");
            serde_json::Value::String(payload_str)
        });

        if attempts > 1 {
            debug!(%queue, job_id = %id, attempts, "Redelivering job");
        }

        Ok(Some(QueuedJob {
            id,
            queue,
            payload,
            attempts,
            enqueued_at: ms_to_datetime(created_at),
        }))
    }

    async fn complete(&self, id: Uuid) -> Result<(), QueueError> {
        self.set_finished(id, JobStatus::Completed, None).await
    }

    async fn retry(&self, id: Uuid, delay: Duration, error: &str) -> Result<(), QueueError> {
        let now = now_ms();
        let available_at = now + delay.as_millis() as i64;
        let count = self
            .conn()
            .execute(
                "UPDATE jobs SET status = 'pending', available_at = ?1, leased_until = NULL, last_error = ?2, updated_at = ?3 WHERE id = ?4",
                params![available_at, error, now, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("retry: {e}")))?;

        if count == 0 {
            return Err(QueueError::NotFound { id });
        }
        Ok(())
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<(), QueueError> {
        self.set_finished(id, JobStatus::Failed, Some(error)).await
    }

    async fn counts(&self, queue: QueueName) -> Result<QueueCounts, QueueError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT status, COUNT(*) FROM jobs WHERE queue = ?1 GROUP BY status",
                params![queue.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("counts: {e}")))?;

        let mut counts = QueueCounts::default();
        while let Ok(Some(row)) = rows.next().await {
            let status: String = row.get(0).unwrap_or_default();
            let count = row.get::<i64>(1).unwrap_or(0) as u64;
            match JobStatus::parse(&status) {
                JobStatus::Pending => counts.pending = count,
                JobStatus::Running => counts.running = count,
                JobStatus::Completed => counts.completed = count,
                JobStatus::Failed => counts.failed = count,
            }
        }
        Ok(counts)
    }
}

/// Spawn a background task that prunes finished jobs every hour.
pub fn spawn_prune_task(
    queue: Arc<LibSqlQueue>,
    keep: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        loop {
            interval.tick().await;
            if let Err(e) = queue.prune_finished(keep).await {
                warn!(error = %e, "Failed to prune finished jobs");
            }
        }
    })
}
