//! Error types for mail-triage.

use std::time::Duration;

use uuid::Uuid;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Durable queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Job {id} not found in queue")]
    NotFound { id: Uuid },

    #[error("Invalid payload for queue {queue}: {reason}")]
    InvalidPayload { queue: String, reason: String },
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },
}

impl LlmError {
    /// Whether a retry has a chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RequestFailed { .. } | Self::RateLimited { .. } | Self::Timeout { .. }
        )
    }
}

/// Mailbox gateway errors, shared by every provider adapter.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Authentication failed for {provider}: {reason}")]
    Auth { provider: String, reason: String },

    #[error("Transport error talking to {provider}: {reason}")]
    Transport { provider: String, reason: String },

    #[error("{provider} resource not found: {what}")]
    NotFound { provider: String, what: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

impl GatewayError {
    /// Transport failures are worth retrying; auth and not-found are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

/// Classifier errors. Either one is a hard stop for the message at hand.
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("Model call failed: {0}")]
    Model(#[from] LlmError),

    #[error("Could not parse model output: {0}")]
    Parse(String),
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Listing messages failed: {0}")]
    Listing(#[source] GatewayError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Classification failed: {0}")]
    Classify(#[from] ClassifyError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("No gateway registered for provider {0}")]
    UnknownProvider(String),
}

/// Outcome of a failed job handler, as seen by the worker pool.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Worth another delivery after backoff.
    #[error("retryable: {0}")]
    Retryable(String),

    /// Retrying cannot help (bad credentials, malformed payload).
    #[error("permanent: {0}")]
    Permanent(String),
}

impl From<PipelineError> for JobError {
    fn from(err: PipelineError) -> Self {
        let retryable = match &err {
            PipelineError::Listing(e) | PipelineError::Gateway(e) => e.is_retryable(),
            PipelineError::Classify(ClassifyError::Model(e)) => e.is_retryable(),
            PipelineError::Classify(ClassifyError::Parse(_)) => false,
            PipelineError::Queue(_) => true,
            PipelineError::UnknownProvider(_) => false,
        };
        if retryable {
            Self::Retryable(err.to_string())
        } else {
            Self::Permanent(err.to_string())
        }
    }
}
