//! Fetch-and-dispatch: one ProcessJob, one mailbox pass.
//!
//! Gmail and Outlook are deliberately different pipelines:
//! - Gmail: classify → label → reply inline (unless Not Interested)
//! - Outlook: enqueue one ReplyJob per unread message, no labeling here
//!
//! Per-message failures are logged and counted; the run moves on. Only a
//! listing failure fails the job.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::ReprocessPolicy;
use crate::error::{JobError, PipelineError};
use crate::gateway::MailboxGateway;
use crate::pipeline::composer;
use crate::pipeline::context::PipelineContext;
use crate::pipeline::stats::FailureKind;
use crate::pipeline::types::{AccessToken, Message, ProcessJob, Provider, ReplyJob};
use crate::queue::JobHandler;

/// Progress of a single fetch-and-dispatch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchJobState {
    Started,
    ListingMessages,
    Classifying,
    Labeling,
    ReplyDispatch,
    Completed,
    Failed,
}

impl FetchJobState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: FetchJobState) -> bool {
        use FetchJobState::*;

        matches!(
            (self, target),
            (Started, ListingMessages)
                | (ListingMessages, Classifying | ReplyDispatch | Completed | Failed)
                // A failed or skipped message moves straight on to the next one.
                | (Classifying, Classifying | Labeling | Completed)
                | (Labeling, Classifying | ReplyDispatch | Completed)
                | (ReplyDispatch, Classifying | ReplyDispatch | Completed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for FetchJobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Started => "started",
            Self::ListingMessages => "listing_messages",
            Self::Classifying => "classifying",
            Self::Labeling => "labeling",
            Self::ReplyDispatch => "reply_dispatch",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Summary of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub provider: Provider,
    pub listed: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub replies_sent: usize,
    pub replies_enqueued: usize,
    pub final_state: FetchJobState,
}

/// State machine plus counters for a run in progress.
struct Run {
    state: FetchJobState,
    report: JobReport,
}

impl Run {
    fn new(provider: Provider) -> Self {
        Self {
            state: FetchJobState::Started,
            report: JobReport {
                provider,
                listed: 0,
                processed: 0,
                skipped: 0,
                failed: 0,
                replies_sent: 0,
                replies_enqueued: 0,
                final_state: FetchJobState::Started,
            },
        }
    }

    fn transition_to(&mut self, next: FetchJobState) -> Result<(), String> {
        if !self.state.can_transition_to(next) {
            return Err(format!("Cannot transition from {} to {}", self.state, next));
        }
        self.state = next;
        self.report.final_state = next;
        Ok(())
    }

    /// Transition, logging instead of failing on an unexpected edge.
    fn advance(&mut self, next: FetchJobState) {
        if let Err(e) = self.transition_to(next) {
            warn!(provider = %self.report.provider, "{e}");
        }
    }

    fn finish(mut self) -> JobReport {
        self.advance(FetchJobState::Completed);
        self.report
    }
}

/// Handler for the process queue.
pub struct FetchAndDispatch {
    ctx: Arc<PipelineContext>,
}

impl FetchAndDispatch {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }

    /// Route a ProcessJob to its provider's pipeline.
    pub async fn run(&self, job: &ProcessJob) -> Result<JobReport, PipelineError> {
        match job.provider {
            Provider::Gmail => self.run_gmail(&job.access_token, job.target()).await,
            Provider::Outlook => self.run_outlook(&job.access_token, job.target()).await,
        }
    }

    async fn list(
        &self,
        run: &mut Run,
        gateway: &dyn MailboxGateway,
        token: &AccessToken,
        target: &str,
    ) -> Result<Vec<Message>, PipelineError> {
        run.advance(FetchJobState::ListingMessages);
        match gateway.list_unread(token, target).await {
            Ok(messages) => {
                run.report.listed = messages.len();
                Ok(messages)
            }
            Err(e) => {
                self.ctx
                    .stats
                    .record_failure(FailureKind::Listing, gateway.provider(), None, &e);
                run.advance(FetchJobState::Failed);
                Err(PipelineError::Listing(e))
            }
        }
    }

    fn skip_for_policy(&self, message: &Message) -> bool {
        self.ctx.settings.reprocess == ReprocessPolicy::SkipIfLabeled && message.has_triage_label()
    }

    fn skip(&self, run: &mut Run, message: &Message, reason: &str) {
        debug!(provider = %message.provider, message_id = %message.id, reason, "Skipping message");
        run.report.skipped += 1;
        self.ctx.stats.skipped();
    }

    /// Gmail: classify, label, then reply inline unless Not Interested.
    pub async fn run_gmail(
        &self,
        token: &AccessToken,
        target: &str,
    ) -> Result<JobReport, PipelineError> {
        let gateway = self.ctx.gateway(Provider::Gmail)?;
        let mut run = Run::new(Provider::Gmail);
        let messages = self.list(&mut run, gateway.as_ref(), token, target).await?;
        info!(target, count = messages.len(), "Processing Gmail messages");

        for message in messages {
            if self.skip_for_policy(&message) {
                self.skip(&mut run, &message, "already labeled");
                continue;
            }

            run.advance(FetchJobState::Classifying);
            let label = match self.ctx.classifier.classify(&message.body).await {
                Ok(label) => label,
                Err(e) => {
                    self.ctx.stats.record_failure(
                        FailureKind::from(&e),
                        Provider::Gmail,
                        Some(&message.id),
                        &e,
                    );
                    run.report.failed += 1;
                    continue;
                }
            };

            run.advance(FetchJobState::Labeling);
            if let Err(e) = gateway.apply_label(token, &message.id, &label).await {
                self.ctx.stats.record_failure(
                    FailureKind::from(&e),
                    Provider::Gmail,
                    Some(&message.id),
                    &e,
                );
                run.report.failed += 1;
                continue;
            }
            self.ctx.stats.labeled();

            if label.warrants_reply() {
                run.advance(FetchJobState::ReplyDispatch);
                let draft = composer::compose_reply(&label, &message.subject);
                if let Err(e) = gateway
                    .send_reply(token, &message.id, &draft.subject, &draft.body)
                    .await
                {
                    // The label stays; a reply that never went out is logged, not rolled back.
                    self.ctx.stats.record_failure(
                        FailureKind::from(&e),
                        Provider::Gmail,
                        Some(&message.id),
                        &e,
                    );
                    run.report.failed += 1;
                    continue;
                }
                run.report.replies_sent += 1;
                self.ctx.stats.replied();
            }

            debug!(message_id = %message.id, label = %label, "Gmail message triaged");
            run.report.processed += 1;
            self.ctx.stats.processed();
        }

        let report = run.finish();
        info!(
            listed = report.listed,
            processed = report.processed,
            skipped = report.skipped,
            failed = report.failed,
            replies_sent = report.replies_sent,
            "Gmail run finished"
        );
        Ok(report)
    }

    /// Outlook: hand each unread message to the reply queue.
    pub async fn run_outlook(
        &self,
        token: &AccessToken,
        target: &str,
    ) -> Result<JobReport, PipelineError> {
        let gateway = self.ctx.gateway(Provider::Outlook)?;
        let mut run = Run::new(Provider::Outlook);
        let messages = self.list(&mut run, gateway.as_ref(), token, target).await?;
        info!(target, count = messages.len(), "Processing Outlook messages");

        for message in messages {
            if message.is_read {
                self.skip(&mut run, &message, "already read");
                continue;
            }
            if self.skip_for_policy(&message) {
                self.skip(&mut run, &message, "already labeled");
                continue;
            }

            run.advance(FetchJobState::ReplyDispatch);
            let job = ReplyJob {
                provider: Provider::Outlook,
                message_id: message.id.clone(),
                access_token: token.clone(),
                email: message.content(),
            };
            match self.ctx.reply_queue.push(&job).await {
                Ok(Some(job_id)) => {
                    debug!(message_id = %message.id, %job_id, "Reply job enqueued");
                    run.report.replies_enqueued += 1;
                    self.ctx.stats.reply_enqueued();
                }
                Ok(None) => {
                    debug!(message_id = %message.id, "Reply job already outstanding");
                }
                Err(e) => {
                    self.ctx.stats.record_failure(
                        FailureKind::Queue,
                        Provider::Outlook,
                        Some(&message.id),
                        &e,
                    );
                    run.report.failed += 1;
                    continue;
                }
            }
            run.report.processed += 1;
            self.ctx.stats.processed();
        }

        let report = run.finish();
        info!(
            listed = report.listed,
            processed = report.processed,
            skipped = report.skipped,
            failed = report.failed,
            replies_enqueued = report.replies_enqueued,
            "Outlook run finished"
        );
        Ok(report)
    }
}

#[async_trait]
impl JobHandler for FetchAndDispatch {
    type Job = ProcessJob;

    async fn handle(&self, job: ProcessJob) -> Result<(), JobError> {
        self.run(&job).await.map(|_| ()).map_err(JobError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gmail_path_is_valid() {
        use FetchJobState::*;
        let path = [
            Started,
            ListingMessages,
            Classifying,
            Labeling,
            ReplyDispatch,
            Classifying,
            Labeling,
            Classifying,
            Completed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn outlook_path_is_valid() {
        use FetchJobState::*;
        let path = [Started, ListingMessages, ReplyDispatch, ReplyDispatch, Completed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn terminal_states_are_final() {
        use FetchJobState::*;
        for next in [Started, ListingMessages, Classifying, Completed, Failed] {
            assert!(!Completed.can_transition_to(next));
            assert!(!Failed.can_transition_to(next));
        }
        assert!(Completed.is_terminal());
        assert!(Failed.is_terminal());
        assert!(!Started.can_transition_to(Classifying));
    }

    #[test]
    fn listing_can_fail_or_be_empty() {
        use FetchJobState::*;
        assert!(ListingMessages.can_transition_to(Failed));
        assert!(ListingMessages.can_transition_to(Completed));
        assert!(!Classifying.can_transition_to(Failed));
    }

    #[test]
    fn run_tracks_final_state() {
        let mut run = Run::new(Provider::Gmail);
        run.advance(FetchJobState::ListingMessages);
        assert!(run.transition_to(FetchJobState::Labeling).is_err());
        let report = run.finish();
        assert_eq!(report.final_state, FetchJobState::Completed);
    }
}
