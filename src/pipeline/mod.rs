//! Email triage pipeline.
//!
//! A ProcessJob runs the fetch-and-dispatch pass for one mailbox:
//! 1. `MailboxGateway::list_unread()`: provider I/O
//! 2. `Classifier`: model call, plain or structured
//! 3. `MailboxGateway::apply_label()` / `send_reply()`, or a ReplyJob
//!
//! Gmail replies inline from templates. Outlook defers to the reply queue,
//! where the structured call drafts the reply.

pub mod classifier;
pub mod composer;
pub mod context;
pub mod fetch_job;
pub mod reply_job;
pub mod stats;
pub mod types;

pub use classifier::Classifier;
pub use context::PipelineContext;
pub use fetch_job::{FetchAndDispatch, FetchJobState, JobReport};
pub use reply_job::{ReplyHandler, ReplyOutcome};
pub use stats::{FailureKind, PipelineStats, StatsSnapshot};
