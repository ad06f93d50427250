//! Producers for the process queue: a fire-and-forget enqueue API and a
//! cron-scheduled tick over the configured mailboxes.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MailboxAccount;
use crate::error::{ConfigError, QueueError};
use crate::pipeline::types::{AccessToken, ProcessJob, Provider};
use crate::queue::TypedQueue;

/// Enqueues "process this mailbox" jobs.
#[derive(Clone)]
pub struct Trigger {
    queue: TypedQueue<ProcessJob>,
}

impl Trigger {
    pub fn new(queue: TypedQueue<ProcessJob>) -> Self {
        Self { queue }
    }

    /// Enqueue one ProcessJob. `None` means a run for this mailbox is
    /// already outstanding.
    pub async fn enqueue(
        &self,
        provider: Provider,
        access_token: AccessToken,
        target: Option<String>,
    ) -> Result<Option<Uuid>, QueueError> {
        let job = ProcessJob {
            provider,
            access_token,
            target,
        };
        let id = self.queue.push(&job).await?;
        match id {
            Some(id) => debug!(%provider, target = job.target(), job_id = %id, "Process job enqueued"),
            None => debug!(%provider, target = job.target(), "Process job already outstanding"),
        }
        Ok(id)
    }

    /// Enqueue one job per mailbox. Failures are logged per mailbox.
    pub async fn enqueue_all(&self, mailboxes: &[MailboxAccount]) -> usize {
        let mut enqueued = 0;
        for mailbox in mailboxes {
            match self
                .enqueue(
                    mailbox.provider,
                    mailbox.access_token.clone(),
                    mailbox.target.clone(),
                )
                .await
            {
                Ok(Some(_)) => enqueued += 1,
                Ok(None) => {}
                Err(e) => {
                    warn!(provider = %mailbox.provider, error = %e, "Failed to enqueue process job")
                }
            }
        }
        enqueued
    }
}

/// Parse a six-field cron expression (seconds first).
pub fn parse_schedule(expr: &str) -> Result<cron::Schedule, ConfigError> {
    cron::Schedule::from_str(expr).map_err(|e| ConfigError::InvalidValue {
        key: "TRIAGE_SCHEDULE".to_string(),
        message: format!("{expr:?}: {e}"),
    })
}

/// Spawn the scheduled tick. Each firing enqueues one ProcessJob per mailbox.
///
/// Returns a `JoinHandle` and shutdown flag.
pub fn spawn_cron_trigger(
    schedule: cron::Schedule,
    mailboxes: Vec<MailboxAccount>,
    trigger: Trigger,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(mailboxes = mailboxes.len(), "Cron trigger started");

        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                warn!("Schedule has no upcoming firings, trigger stopping");
                return;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Cron trigger shutting down");
                return;
            }

            let enqueued = trigger.enqueue_all(&mailboxes).await;
            debug!(enqueued, "Cron tick");
        }
    });

    (handle, shutdown_flag)
}
