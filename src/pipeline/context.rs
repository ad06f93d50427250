//! Shared dependencies for the job handlers.

use std::sync::Arc;

use crate::config::PipelineSettings;
use crate::error::PipelineError;
use crate::gateway::{GatewayRegistry, MailboxGateway};
use crate::pipeline::classifier::Classifier;
use crate::pipeline::stats::PipelineStats;
use crate::pipeline::types::{Provider, ReplyJob};
use crate::queue::TypedQueue;

/// Everything a pipeline run touches. Built once in `main`, fakes in tests.
pub struct PipelineContext {
    pub gateways: GatewayRegistry,
    pub classifier: Arc<Classifier>,
    pub reply_queue: TypedQueue<ReplyJob>,
    pub stats: Arc<PipelineStats>,
    pub settings: PipelineSettings,
}

impl PipelineContext {
    pub fn gateway(&self, provider: Provider) -> Result<Arc<dyn MailboxGateway>, PipelineError> {
        self.gateways
            .get(provider)
            .ok_or_else(|| PipelineError::UnknownProvider(provider.to_string()))
    }
}
