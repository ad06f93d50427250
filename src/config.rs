//! Configuration types, built from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rand::Rng;

use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};
use crate::pipeline::types::{AccessToken, Provider};
use crate::queue::trigger::parse_schedule;

/// Default trigger schedule: every 30 seconds.
pub const DEFAULT_SCHEDULE: &str = "*/30 * * * * *";

/// Exponential backoff policy, shared by the queue runtime and the model
/// retry decorator.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Randomize each delay into `[d/2, d]`.
    pub jitter: bool,
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `attempts_made` attempts.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Delay to wait after attempt number `attempt` (1-based) failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let raw = self.base_delay.saturating_mul(1u32 << exp);
        let capped = raw.min(self.max_delay);
        if !self.jitter || capped.is_zero() {
            return capped;
        }
        let half = capped / 2;
        let spread = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(spread)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            jitter: true,
        }
    }
}

/// Settings for one queue's worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent workers pulling from the queue.
    pub workers: usize,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// How long a reserved job stays invisible before redelivery.
    pub lease: Duration,
    /// Hard limit for one handler invocation. Must be shorter than `lease`.
    pub job_timeout: Duration,
    /// Retry policy applied to failed jobs.
    pub retry: RetryPolicy,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            poll_interval: Duration::from_secs(1),
            lease: Duration::from_secs(300),
            job_timeout: Duration::from_secs(240),
            retry: RetryPolicy::default(),
        }
    }
}

/// What to do with a message that already carries a triage label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReprocessPolicy {
    /// Classify and act on every listed message.
    #[default]
    AlwaysReprocess,
    /// Skip messages that carry any known triage label.
    SkipIfLabeled,
}

impl FromStr for ReprocessPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "always" | "always-reprocess" => Ok(Self::AlwaysReprocess),
            "skip" | "skip-if-labeled" => Ok(Self::SkipIfLabeled),
            other => Err(format!("unknown reprocess policy '{other}'")),
        }
    }
}

/// Behavior switches for the two pipelines.
#[derive(Debug, Clone, Default)]
pub struct PipelineSettings {
    pub reprocess: ReprocessPolicy,
    /// Apply the structured label in the Outlook reply job before sending.
    pub label_outlook_replies: bool,
}

/// A mailbox the scheduled trigger enqueues work for.
#[derive(Debug, Clone)]
pub struct MailboxAccount {
    pub provider: Provider,
    pub access_token: AccessToken,
    pub target: Option<String>,
}

/// Top-level daemon configuration.
#[derive(Debug, Clone)]
pub struct TriageConfig {
    pub db_path: PathBuf,
    pub llm: LlmConfig,
    pub llm_timeout: Duration,
    pub llm_retry: RetryPolicy,
    pub gateway_timeout: Duration,
    /// Max messages fetched per listing.
    pub list_limit: u32,
    pub process_pool: WorkerPoolConfig,
    pub reply_pool: WorkerPoolConfig,
    pub pipeline: PipelineSettings,
    /// Cron expression (with seconds) for the mailbox trigger.
    pub schedule: String,
    pub mailboxes: Vec<MailboxAccount>,
    /// Directory for rolling log files; stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

impl TriageConfig {
    /// Build config from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);

        let backend = match env.get("TRIAGE_LLM_BACKEND") {
            None => LlmBackend::OpenAi,
            Some(raw) => raw.parse::<LlmBackend>().map_err(|message| ConfigError::InvalidValue {
                key: "TRIAGE_LLM_BACKEND".into(),
                message,
            })?,
        };
        let key_var = backend.api_key_var();
        let default_model = backend.default_model();
        let api_key = env
            .get(key_var)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar(key_var.to_string()))?;
        let llm = LlmConfig {
            backend,
            api_key: secrecy::SecretString::from(api_key),
            model: env
                .get("TRIAGE_MODEL")
                .unwrap_or_else(|| default_model.to_string()),
        };

        let job_retry = RetryPolicy {
            max_attempts: env.parse("TRIAGE_JOB_MAX_ATTEMPTS", 5)?,
            base_delay: Duration::from_secs(env.parse("TRIAGE_JOB_BACKOFF_SECS", 5)?),
            max_delay: Duration::from_secs(env.parse("TRIAGE_JOB_MAX_BACKOFF_SECS", 300)?),
            jitter: true,
        };
        let pool = |workers_key: &str, default_workers: usize| -> Result<WorkerPoolConfig, ConfigError> {
            Ok(WorkerPoolConfig {
                workers: env.parse(workers_key, default_workers)?,
                poll_interval: Duration::from_millis(env.parse("TRIAGE_POLL_INTERVAL_MS", 1000)?),
                lease: Duration::from_secs(env.parse("TRIAGE_LEASE_SECS", 300)?),
                job_timeout: Duration::from_secs(env.parse("TRIAGE_JOB_TIMEOUT_SECS", 240)?),
                retry: job_retry.clone(),
            })
        };
        let process_pool = pool("TRIAGE_PROCESS_WORKERS", 1)?;
        let reply_pool = pool("TRIAGE_REPLY_WORKERS", 4)?;
        if process_pool.job_timeout >= process_pool.lease {
            return Err(ConfigError::InvalidValue {
                key: "TRIAGE_JOB_TIMEOUT_SECS".into(),
                message: "job timeout must be shorter than the lease".into(),
            });
        }
        if process_pool.workers == 0 || reply_pool.workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TRIAGE_*_WORKERS".into(),
                message: "each pool needs at least one worker".into(),
            });
        }

        let schedule = env
            .get("TRIAGE_SCHEDULE")
            .unwrap_or_else(|| DEFAULT_SCHEDULE.to_string());
        parse_schedule(&schedule)?;

        let mut mailboxes = Vec::new();
        for (provider, token_key, target_key) in [
            (Provider::Gmail, "GMAIL_ACCESS_TOKEN", "GMAIL_TARGET"),
            (Provider::Outlook, "OUTLOOK_ACCESS_TOKEN", "OUTLOOK_TARGET"),
        ] {
            if let Some(token) = env.get(token_key).filter(|t| !t.is_empty()) {
                mailboxes.push(MailboxAccount {
                    provider,
                    access_token: AccessToken::new(token),
                    target: env.get(target_key).filter(|t| !t.is_empty()),
                });
            }
        }

        let pipeline = PipelineSettings {
            reprocess: env.parse("TRIAGE_REPROCESS_POLICY", ReprocessPolicy::AlwaysReprocess)?,
            label_outlook_replies: env.parse("TRIAGE_LABEL_OUTLOOK_REPLIES", false)?,
        };

        Ok(Self {
            db_path: env
                .get("TRIAGE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/mail-triage.db")),
            llm,
            llm_timeout: Duration::from_secs(env.parse("TRIAGE_LLM_TIMEOUT_SECS", 30)?),
            llm_retry: RetryPolicy {
                max_attempts: env.parse("TRIAGE_LLM_MAX_ATTEMPTS", 2)?,
                base_delay: Duration::from_millis(env.parse("TRIAGE_LLM_BACKOFF_MS", 500)?),
                max_delay: Duration::from_secs(10),
                jitter: true,
            },
            gateway_timeout: Duration::from_secs(env.parse("TRIAGE_GATEWAY_TIMEOUT_SECS", 20)?),
            list_limit: env.parse("TRIAGE_LIST_LIMIT", 25)?,
            process_pool,
            reply_pool,
            pipeline,
            schedule,
            mailboxes,
            log_dir: env.get("TRIAGE_LOG_DIR").map(PathBuf::from),
        })
    }
}

/// Thin helper over the lookup closure.
struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(raw) if raw.is_empty() => Ok(default),
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        }
    }
}
