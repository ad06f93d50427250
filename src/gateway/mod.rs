//! Mailbox gateways.
//!
//! One trait, one adapter per provider. Provider payload shapes stop at the
//! adapter; everything above sees `Message` and `GatewayError`.

pub mod gmail;
pub mod outlook;

pub use gmail::GmailGateway;
pub use outlook::OutlookGateway;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;

use crate::error::GatewayError;
use crate::pipeline::types::{AccessToken, Message, Provider, TriageLabel};

/// Provider-side mailbox operations the pipeline needs.
#[async_trait]
pub trait MailboxGateway: Send + Sync {
    fn provider(&self) -> Provider;

    /// Messages in `target` (Gmail label id or Outlook folder id).
    ///
    /// Gmail returns unread messages only. Outlook returns the folder's
    /// most recent messages, read or not; callers filter on `is_read`.
    async fn list_unread(
        &self,
        token: &AccessToken,
        target: &str,
    ) -> Result<Vec<Message>, GatewayError>;

    /// Ensure the label exists, then attach it. Safe to repeat.
    async fn apply_label(
        &self,
        token: &AccessToken,
        message_id: &str,
        label: &TriageLabel,
    ) -> Result<(), GatewayError>;

    /// Reply to `message_id` in its thread.
    async fn send_reply(
        &self,
        token: &AccessToken,
        message_id: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), GatewayError>;
}

/// Provider tag → gateway.
#[derive(Default, Clone)]
pub struct GatewayRegistry {
    gateways: HashMap<Provider, Arc<dyn MailboxGateway>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, gateway: Arc<dyn MailboxGateway>) {
        self.gateways.insert(gateway.provider(), gateway);
    }

    pub fn with(mut self, gateway: Arc<dyn MailboxGateway>) -> Self {
        self.register(gateway);
        self
    }

    pub fn get(&self, provider: Provider) -> Option<Arc<dyn MailboxGateway>> {
        self.gateways.get(&provider).cloned()
    }
}

// ── Shared HTTP plumbing ────────────────────────────────────────────

pub(crate) fn build_client(
    provider: Provider,
    timeout: Duration,
) -> Result<reqwest::Client, GatewayError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| GatewayError::Transport {
            provider: provider.to_string(),
            reason: format!("Failed to build HTTP client: {e}"),
        })
}

pub(crate) fn parse_base_url(provider: Provider, base: &str) -> Result<Url, GatewayError> {
    let url = Url::parse(base.trim_end_matches('/')).map_err(|e| GatewayError::Transport {
        provider: provider.to_string(),
        reason: format!("Invalid base URL {base:?}: {e}"),
    })?;
    if url.cannot_be_a_base() {
        return Err(GatewayError::Transport {
            provider: provider.to_string(),
            reason: format!("Invalid base URL {base:?}"),
        });
    }
    Ok(url)
}

/// Append percent-encoded path segments to `base`.
pub(crate) fn join_path(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}

pub(crate) fn transport_error(provider: Provider, err: reqwest::Error) -> GatewayError {
    let reason = if err.is_timeout() {
        format!("request timed out: {err}")
    } else {
        err.to_string()
    };
    GatewayError::Transport {
        provider: provider.to_string(),
        reason,
    }
}

/// Map an HTTP status to the gateway error taxonomy.
pub(crate) fn status_error(
    provider: Provider,
    status: StatusCode,
    what: &str,
    body: &str,
) -> GatewayError {
    let provider = provider.to_string();
    let snippet: String = body.chars().take(200).collect();
    match status.as_u16() {
        401 | 403 => GatewayError::Auth {
            provider,
            reason: format!("{status} on {what}: {snippet}"),
        },
        404 => GatewayError::NotFound {
            provider,
            what: what.to_string(),
        },
        429 | 500..=599 => GatewayError::Transport {
            provider,
            reason: format!("{status} on {what}: {snippet}"),
        },
        _ => GatewayError::InvalidResponse {
            provider,
            reason: format!("unexpected {status} on {what}: {snippet}"),
        },
    }
}

/// Pass through a successful response, map anything else.
pub(crate) async fn check_status(
    provider: Provider,
    what: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(provider, status, what, &body))
}

pub(crate) async fn read_json<T: DeserializeOwned>(
    provider: Provider,
    what: &str,
    response: reqwest::Response,
) -> Result<T, GatewayError> {
    let response = check_status(provider, what, response).await?;
    let bytes = response
        .bytes()
        .await
        .map_err(|e| transport_error(provider, e))?;
    serde_json::from_slice(&bytes).map_err(|e| GatewayError::InvalidResponse {
        provider: provider.to_string(),
        reason: format!("{what}: {e}"),
    })
}
