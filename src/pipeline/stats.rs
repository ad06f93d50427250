//! Pipeline counters and failure classification.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use crate::error::{ClassifyError, GatewayError};
use crate::pipeline::types::Provider;

/// Category of a recorded failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Auth,
    Transport,
    NotFound,
    InvalidResponse,
    Model,
    Parse,
    Listing,
    Queue,
}

impl FailureKind {
    pub const ALL: [FailureKind; 8] = [
        Self::Auth,
        Self::Transport,
        Self::NotFound,
        Self::InvalidResponse,
        Self::Model,
        Self::Parse,
        Self::Listing,
        Self::Queue,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Transport => "transport",
            Self::NotFound => "not_found",
            Self::InvalidResponse => "invalid_response",
            Self::Model => "model",
            Self::Parse => "parse",
            Self::Listing => "listing",
            Self::Queue => "queue",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&GatewayError> for FailureKind {
    fn from(err: &GatewayError) -> Self {
        match err {
            GatewayError::Auth { .. } => Self::Auth,
            GatewayError::Transport { .. } => Self::Transport,
            GatewayError::NotFound { .. } => Self::NotFound,
            GatewayError::InvalidResponse { .. } => Self::InvalidResponse,
        }
    }
}

impl From<&ClassifyError> for FailureKind {
    fn from(err: &ClassifyError) -> Self {
        match err {
            ClassifyError::Model(_) => Self::Model,
            ClassifyError::Parse(_) => Self::Parse,
        }
    }
}

/// Process-wide counters, shared by both pipelines.
#[derive(Debug, Default)]
pub struct PipelineStats {
    processed: AtomicU64,
    labeled: AtomicU64,
    replied: AtomicU64,
    reply_enqueued: AtomicU64,
    skipped: AtomicU64,
    failures: [AtomicU64; FailureKind::ALL.len()],
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub processed: u64,
    pub labeled: u64,
    pub replied: u64,
    pub reply_enqueued: u64,
    pub skipped: u64,
    failures: [u64; FailureKind::ALL.len()],
}

impl StatsSnapshot {
    pub fn failures(&self, kind: FailureKind) -> u64 {
        self.failures[kind.index()]
    }

    pub fn total_failures(&self) -> u64 {
        self.failures.iter().sum()
    }
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn labeled(&self) {
        self.labeled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn replied(&self) {
        self.replied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reply_enqueued(&self) {
        self.reply_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failure and emit one structured event for it.
    pub fn record_failure(
        &self,
        kind: FailureKind,
        provider: Provider,
        message_id: Option<&str>,
        error: &dyn fmt::Display,
    ) {
        self.failures[kind.index()].fetch_add(1, Ordering::Relaxed);
        warn!(
            failure_kind = kind.as_str(),
            %provider,
            message_id = message_id.unwrap_or("-"),
            error = %error,
            "Pipeline step failed"
        );
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let mut failures = [0; FailureKind::ALL.len()];
        for (slot, counter) in failures.iter_mut().zip(&self.failures) {
            *slot = counter.load(Ordering::Relaxed);
        }
        StatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            labeled: self.labeled.load(Ordering::Relaxed),
            replied: self.replied.load(Ordering::Relaxed),
            reply_enqueued: self.reply_enqueued.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failures,
        }
    }
}
