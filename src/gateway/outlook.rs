//! Microsoft Graph v1.0 gateway for Outlook mailboxes.
//!
//! Labels are Outlook categories: a master category list per mailbox plus a
//! `categories` array on each message.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{
    MailboxGateway, build_client, check_status, join_path, parse_base_url, read_json,
    transport_error,
};
use crate::error::GatewayError;
use crate::pipeline::types::{AccessToken, Message, Provider, TriageLabel};

const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";

const MESSAGE_FIELDS: &str = "id,subject,bodyPreview,isRead,sender,toRecipients,categories,conversationId,internetMessageId";

/// Category color for labels we create.
const DEFAULT_CATEGORY_COLOR: &str = "preset0";

#[derive(Debug, Deserialize)]
struct GraphList<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    id: String,
    subject: Option<String>,
    body_preview: Option<String>,
    #[serde(default)]
    is_read: bool,
    sender: Option<Recipient>,
    #[serde(default)]
    to_recipients: Vec<Recipient>,
    #[serde(default)]
    categories: Vec<String>,
    conversation_id: Option<String>,
    internet_message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Recipient {
    email_address: Option<EmailAddress>,
}

#[derive(Debug, Deserialize)]
struct EmailAddress {
    address: Option<String>,
}

impl Recipient {
    fn address(&self) -> Option<&str> {
        self.email_address
            .as_ref()
            .and_then(|e| e.address.as_deref())
            .filter(|a| !a.is_empty())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MasterCategory {
    display_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateCategoryRequest<'a> {
    display_name: &'a str,
    color: &'static str,
}

#[derive(Debug, Deserialize)]
struct MessageCategories {
    #[serde(default)]
    categories: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateMessageRequest {
    categories: Vec<String>,
    is_read: bool,
}

#[derive(Debug, Serialize)]
struct ReplyRequest<'a> {
    message: ReplyMessage<'a>,
    comment: &'a str,
}

#[derive(Debug, Serialize)]
struct ReplyMessage<'a> {
    subject: &'a str,
}

/// Outlook mailbox gateway.
pub struct OutlookGateway {
    client: reqwest::Client,
    base: Url,
    list_limit: u32,
}

impl OutlookGateway {
    pub fn new(timeout: Duration, list_limit: u32) -> Result<Self, GatewayError> {
        Self::with_base_url(GRAPH_API_BASE, timeout, list_limit)
    }

    /// Point at a different API root (tests use a local fake).
    pub fn with_base_url(
        base: &str,
        timeout: Duration,
        list_limit: u32,
    ) -> Result<Self, GatewayError> {
        Ok(Self {
            client: build_client(Provider::Outlook, timeout)?,
            base: parse_base_url(Provider::Outlook, base)?,
            list_limit,
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        join_path(&self.base, segments)
    }

    fn bearer(token: &AccessToken) -> String {
        format!("Bearer {}", token.expose())
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        token: &AccessToken,
        url: Url,
        what: &str,
    ) -> Result<T, GatewayError> {
        let response = self
            .client
            .get(url)
            .header(AUTHORIZATION, Self::bearer(token))
            .send()
            .await
            .map_err(|e| transport_error(Provider::Outlook, e))?;
        read_json(Provider::Outlook, what, response).await
    }

    async fn master_categories(
        &self,
        token: &AccessToken,
    ) -> Result<Vec<MasterCategory>, GatewayError> {
        let list: GraphList<MasterCategory> = self
            .get_json(
                token,
                self.url(&["me", "outlook", "masterCategories"]),
                "masterCategories",
            )
            .await?;
        Ok(list.value)
    }

    /// Create the master category when absent.
    async fn ensure_category(&self, token: &AccessToken, name: &str) -> Result<(), GatewayError> {
        let exists = self
            .master_categories(token)
            .await?
            .iter()
            .any(|c| c.display_name.eq_ignore_ascii_case(name));
        if exists {
            return Ok(());
        }

        let response = self
            .client
            .post(self.url(&["me", "outlook", "masterCategories"]))
            .header(AUTHORIZATION, Self::bearer(token))
            .json(&CreateCategoryRequest {
                display_name: name,
                color: DEFAULT_CATEGORY_COLOR,
            })
            .send()
            .await
            .map_err(|e| transport_error(Provider::Outlook, e))?;

        if response.status() == StatusCode::CONFLICT {
            debug!(category = name, "Category created concurrently");
            return Ok(());
        }
        check_status(Provider::Outlook, "masterCategories.create", response).await?;
        info!(category = name, "Created Outlook category");
        Ok(())
    }
}

fn to_message(raw: GraphMessage) -> Message {
    let subject = raw
        .subject
        .unwrap_or_else(|| Message::NO_SUBJECT.to_string());
    let sender = raw
        .sender
        .as_ref()
        .and_then(Recipient::address)
        .unwrap_or(Message::UNKNOWN_SENDER)
        .to_string();
    let recipient = raw
        .to_recipients
        .first()
        .and_then(Recipient::address)
        .unwrap_or(Message::UNKNOWN_RECIPIENT)
        .to_string();

    Message {
        id: raw.id,
        provider: Provider::Outlook,
        subject,
        sender,
        recipient,
        body: raw.body_preview.unwrap_or_default(),
        is_read: raw.is_read,
        thread_id: raw.conversation_id,
        internet_message_id: raw.internet_message_id,
        labels: raw.categories,
    }
}

/// Set union, keeping existing order and matching names case-insensitively.
fn merge_categories(mut existing: Vec<String>, name: &str) -> Vec<String> {
    if !existing.iter().any(|c| c.eq_ignore_ascii_case(name)) {
        existing.push(name.to_string());
    }
    existing
}

#[async_trait]
impl MailboxGateway for OutlookGateway {
    fn provider(&self) -> Provider {
        Provider::Outlook
    }

    async fn list_unread(
        &self,
        token: &AccessToken,
        target: &str,
    ) -> Result<Vec<Message>, GatewayError> {
        let mut url = self.url(&["me", "mailFolders", target, "messages"]);
        url.query_pairs_mut()
            .append_pair("$select", MESSAGE_FIELDS)
            .append_pair("$top", &self.list_limit.to_string());

        let list: GraphList<GraphMessage> = self.get_json(token, url, "messages.list").await?;
        let messages: Vec<Message> = list.value.into_iter().map(to_message).collect();
        debug!(target, count = messages.len(), "Listed Outlook messages");
        Ok(messages)
    }

    async fn apply_label(
        &self,
        token: &AccessToken,
        message_id: &str,
        label: &TriageLabel,
    ) -> Result<(), GatewayError> {
        let name = label.display_name();
        self.ensure_category(token, name).await?;

        let what = format!("message {message_id}");
        let mut url = self.url(&["me", "messages", message_id]);
        url.query_pairs_mut().append_pair("$select", "categories");
        let current: MessageCategories = self.get_json(token, url, &what).await?;

        let response = self
            .client
            .patch(self.url(&["me", "messages", message_id]))
            .header(AUTHORIZATION, Self::bearer(token))
            .json(&UpdateMessageRequest {
                categories: merge_categories(current.categories, name),
                is_read: true,
            })
            .send()
            .await
            .map_err(|e| transport_error(Provider::Outlook, e))?;
        check_status(Provider::Outlook, &what, response).await?;

        debug!(message_id, label = %label, "Applied Outlook category");
        Ok(())
    }

    async fn send_reply(
        &self,
        token: &AccessToken,
        message_id: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), GatewayError> {
        let response = self
            .client
            .post(self.url(&["me", "messages", message_id, "reply"]))
            .header(AUTHORIZATION, Self::bearer(token))
            .json(&ReplyRequest {
                message: ReplyMessage { subject },
                comment: body,
            })
            .send()
            .await
            .map_err(|e| transport_error(Provider::Outlook, e))?;
        check_status(Provider::Outlook, &format!("message {message_id}"), response).await?;

        info!(message_id, "Sent Outlook reply");
        Ok(())
    }
}
