//! Reply job: structured classification, then send the drafted reply.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{JobError, PipelineError};
use crate::pipeline::context::PipelineContext;
use crate::pipeline::stats::FailureKind;
use crate::pipeline::types::{ReplyJob, TriageLabel};
use crate::queue::JobHandler;

/// How a reply job ended, when it did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyOutcome {
    Sent { label: TriageLabel },
    /// Classification failed; nothing was sent.
    Abandoned,
}

/// Handler for the reply queue.
pub struct ReplyHandler {
    ctx: Arc<PipelineContext>,
}

impl ReplyHandler {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }

    pub async fn run(&self, job: &ReplyJob) -> Result<ReplyOutcome, PipelineError> {
        let stats = &self.ctx.stats;
        let gateway = self.ctx.gateway(job.provider)?;

        let classification = match self.ctx.classifier.classify_with_reply(&job.email).await {
            Ok(c) => c,
            Err(e) => {
                stats.record_failure(FailureKind::from(&e), job.provider, Some(&job.message_id), &e);
                return Ok(ReplyOutcome::Abandoned);
            }
        };
        debug!(message_id = %job.message_id, label = %classification.label, "Reply drafted");

        if self.ctx.settings.label_outlook_replies {
            match gateway
                .apply_label(&job.access_token, &job.message_id, &classification.label)
                .await
            {
                Ok(()) => stats.labeled(),
                // Labeling is idempotent, so the whole job can run again.
                Err(e) if e.is_retryable() => {
                    stats.record_failure(FailureKind::from(&e), job.provider, Some(&job.message_id), &e);
                    return Err(PipelineError::Gateway(e));
                }
                Err(e) => {
                    stats.record_failure(FailureKind::from(&e), job.provider, Some(&job.message_id), &e);
                }
            }
        }

        if let Err(e) = gateway
            .send_reply(
                &job.access_token,
                &job.message_id,
                &classification.reply.subject,
                &classification.reply.body,
            )
            .await
        {
            stats.record_failure(FailureKind::from(&e), job.provider, Some(&job.message_id), &e);
            return Err(PipelineError::Gateway(e));
        }

        stats.replied();
        info!(
            provider = %job.provider,
            message_id = %job.message_id,
            label = %classification.label,
            "Reply sent"
        );
        Ok(ReplyOutcome::Sent {
            label: classification.label,
        })
    }
}

#[async_trait]
impl JobHandler for ReplyHandler {
    type Job = ReplyJob;

    async fn handle(&self, job: ReplyJob) -> Result<(), JobError> {
        self.run(&job).await.map(|_| ()).map_err(JobError::from)
    }
}
