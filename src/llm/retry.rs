//! Timeout and bounded-retry decorator for any `LlmProvider`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::config::RetryPolicy;
use crate::error::LlmError;
use crate::llm::provider::{CompletionRequest, CompletionResponse, LlmProvider};

/// Wraps a provider with a per-call timeout and exponential backoff.
///
/// Only transient errors (request failures, rate limits, timeouts) are
/// retried. A successful response passes through untouched.
pub struct RetryingProvider {
    inner: Arc<dyn LlmProvider>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl RetryingProvider {
    pub fn new(inner: Arc<dyn LlmProvider>, policy: RetryPolicy, timeout: Duration) -> Self {
        Self {
            inner,
            policy,
            timeout,
        }
    }
}

#[async_trait]
impl LlmProvider for RetryingProvider {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result =
                match tokio::time::timeout(self.timeout, self.inner.complete(request.clone())).await
                {
                    Ok(result) => result,
                    Err(_) => Err(LlmError::Timeout {
                        provider: self.inner.model_name().to_string(),
                        timeout: self.timeout,
                    }),
                };

            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && self.policy.should_retry(attempt) => {
                    let delay = match &e {
                        LlmError::RateLimited {
                            retry_after: Some(after),
                            ..
                        } => *after,
                        _ => self.policy.delay_for(attempt),
                    };
                    warn!(
                        model = self.inner.model_name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Model call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
