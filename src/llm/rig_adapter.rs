//! Bridges rig-core's `CompletionModel` to our `LlmProvider` trait.

use async_trait::async_trait;
use rig::agent::AgentBuilder;
use rig::completion::{CompletionModel, Prompt};

use crate::error::LlmError;
use crate::llm::provider::{CompletionRequest, CompletionResponse, LlmProvider};

/// Adapter over any rig completion model.
///
/// A fresh agent is built per call so each request can carry its own
/// preamble, temperature and token limit.
pub struct RigAdapter<M: CompletionModel> {
    model: M,
    model_name: String,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(model: M, model_name: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
        }
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let preamble = request.system_prompt();
        let prompt = request.user_prompt();

        let mut builder = AgentBuilder::new(self.model.clone()).preamble(&preamble);
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(u64::from(max_tokens));
        }
        let agent = builder.build();

        // An empty user turn is rejected by some providers; fold the
        // preamble into the prompt instead.
        let prompt = if prompt.is_empty() { preamble } else { prompt };

        let content = agent
            .prompt(prompt.as_str())
            .await
            .map_err(|e| classify_rig_error(&self.model_name, e.to_string()))?;
        if content.trim().is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.model_name.clone(),
                reason: "empty completion".to_string(),
            });
        }

        tracing::debug!(model = %self.model_name, chars = content.len(), "Completion received");
        Ok(CompletionResponse::text(content))
    }
}

/// Map rig's stringly errors onto our taxonomy.
fn classify_rig_error(model: &str, reason: String) -> LlmError {
    let lower = reason.to_lowercase();
    if lower.contains("401") || lower.contains("unauthorized") || lower.contains("invalid api key")
    {
        LlmError::AuthFailed {
            provider: model.to_string(),
        }
    } else if lower.contains("429") || lower.contains("rate limit") {
        LlmError::RateLimited {
            provider: model.to_string(),
            retry_after: None,
        }
    } else {
        LlmError::RequestFailed {
            provider: model.to_string(),
            reason,
        }
    }
}
