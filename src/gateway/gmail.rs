//! Gmail REST v1 gateway.
//!
//! - `users.messages.list` + `users.messages.get (metadata)` for listing
//! - `users.labels.list/create` + `users.messages.modify` for labeling
//! - `users.messages.send` with a lettre-built RFC 5322 reply

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::*;
use lettre::message::{Mailbox, Mailboxes};
use reqwest::header::AUTHORIZATION;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    MailboxGateway, build_client, check_status, join_path, parse_base_url, read_json,
    status_error, transport_error,
};
use crate::error::GatewayError;
use crate::pipeline::types::{AccessToken, Message, Provider, TriageLabel};

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

/// Labels removed once a message is triaged, so it is not listed again.
const TRIAGED_REMOVE_LABELS: [&str; 2] = ["INBOX", "UNREAD"];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    thread_id: Option<String>,
    #[serde(default)]
    label_ids: Vec<String>,
    snippet: Option<String>,
    payload: Option<GmailPayload>,
}

#[derive(Debug, Deserialize)]
struct GmailPayload {
    #[serde(default)]
    headers: Vec<GmailHeader>,
}

#[derive(Debug, Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

impl GmailMessage {
    fn header(&self, name: &str) -> Option<&str> {
        self.payload.as_ref().and_then(|p| {
            p.headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case(name))
                .map(|h| h.value.as_str())
        })
    }
}

#[derive(Debug, Deserialize)]
struct GmailLabel {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct LabelsListResponse {
    #[serde(default)]
    labels: Vec<GmailLabel>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateLabelRequest<'a> {
    name: &'a str,
    label_list_visibility: &'static str,
    message_list_visibility: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModifyRequest {
    add_label_ids: Vec<String>,
    remove_label_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendRequest {
    raw: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    thread_id: Option<String>,
}

/// Gmail mailbox gateway.
pub struct GmailGateway {
    client: reqwest::Client,
    base: Url,
    list_limit: u32,
}

impl GmailGateway {
    pub fn new(timeout: Duration, list_limit: u32) -> Result<Self, GatewayError> {
        Self::with_base_url(GMAIL_API_BASE, timeout, list_limit)
    }

    /// Point at a different API root (tests use a local fake).
    pub fn with_base_url(
        base: &str,
        timeout: Duration,
        list_limit: u32,
    ) -> Result<Self, GatewayError> {
        Ok(Self {
            client: build_client(Provider::Gmail, timeout)?,
            base: parse_base_url(Provider::Gmail, base)?,
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
            .map_err(|e| transport_error(Provider::Gmail, e))?;
        read_json(Provider::Gmail, what, response).await
    }

    async fn list_labels(&self, token: &AccessToken) -> Result<Vec<GmailLabel>, GatewayError> {
        let list: LabelsListResponse = self
            .get_json(token, self.url(&["labels"]), "labels.list")
            .await?;
        Ok(list.labels)
    }

    async fn get_metadata(
        &self,
        token: &AccessToken,
        message_id: &str,
    ) -> Result<GmailMessage, GatewayError> {
        let mut url = self.url(&["messages", message_id]);
        url.query_pairs_mut()
            .append_pair("format", "metadata")
            .append_pair("metadataHeaders", "Subject")
            .append_pair("metadataHeaders", "From")
            .append_pair("metadataHeaders", "To")
            .append_pair("metadataHeaders", "Message-ID");
        self.get_json(token, url, &format!("message {message_id}"))
            .await
    }

    /// Find a label by name, creating it when absent.
    async fn ensure_label(&self, token: &AccessToken, name: &str) -> Result<String, GatewayError> {
        if let Some(label) = find_label(self.list_labels(token).await?, name) {
            return Ok(label.id);
        }

        let response = self
            .client
            .post(self.url(&["labels"]))
            .header(AUTHORIZATION, Self::bearer(token))
            .json(&CreateLabelRequest {
                name,
                label_list_visibility: "labelShow",
                message_list_visibility: "show",
            })
            .send()
            .await
            .map_err(|e| transport_error(Provider::Gmail, e))?;

        // Lost a race with a concurrent create; the label exists now.
        if response.status() == StatusCode::CONFLICT {
            debug!(label = name, "Label created concurrently, re-listing");
            return find_label(self.list_labels(token).await?, name)
                .map(|l| l.id)
                .ok_or_else(|| GatewayError::InvalidResponse {
                    provider: Provider::Gmail.to_string(),
                    reason: format!("label {name:?} reported as existing but not listed"),
                });
        }

        let created: GmailLabel = read_json(Provider::Gmail, "labels.create", response).await?;
        info!(label = name, label_id = %created.id, "Created Gmail label");
        Ok(created.id)
    }
}

fn find_label(labels: Vec<GmailLabel>, name: &str) -> Option<GmailLabel> {
    labels
        .into_iter()
        .find(|l| l.name.eq_ignore_ascii_case(name))
}

/// First address of a header value, e.g. `"Doe, Ann" <ann@x.com>, bob@y.com`.
fn first_mailbox(header: &str) -> Option<Mailbox> {
    if let Ok(list) = header.parse::<Mailboxes>()
        && let Some(first) = list.iter().next().cloned()
    {
        return Some(first);
    }
    split_addresses(header)
        .into_iter()
        .map(str::trim)
        .find(|s| !s.is_empty())
        .and_then(|s| s.parse().ok())
}

/// Split an address list on commas that sit outside quotes and angle brackets.
fn split_addresses(header: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut escaped = false;
    let mut angle = 0usize;
    for (i, c) in header.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => angle += 1,
            '>' if !in_quotes => angle = angle.saturating_sub(1),
            ',' if !in_quotes && angle == 0 => {
                parts.push(&header[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&header[start..]);
    parts
}

fn to_message(raw: GmailMessage, names: &HashMap<String, String>) -> Message {
    let subject = raw.header("Subject").unwrap_or(Message::NO_SUBJECT).to_string();
    let sender = raw.header("From").unwrap_or(Message::UNKNOWN_SENDER).to_string();
    let recipient = raw
        .header("To")
        .unwrap_or(Message::UNKNOWN_RECIPIENT)
        .to_string();
    let internet_message_id = raw.header("Message-ID").map(str::to_string);
    let is_read = !raw.label_ids.iter().any(|l| l == "UNREAD");
    let labels = raw
        .label_ids
        .iter()
        .map(|id| names.get(id).cloned().unwrap_or_else(|| id.clone()))
        .collect();

    Message {
        id: raw.id,
        provider: Provider::Gmail,
        subject,
        sender,
        recipient,
        body: raw.snippet.unwrap_or_default(),
        is_read,
        thread_id: raw.thread_id,
        internet_message_id,
        labels,
    }
}

/// Build the raw RFC 5322 reply, base64url-encoded for `messages.send`.
fn encode_reply(original: &GmailMessage, subject: &str, body: &str) -> Result<String, GatewayError> {
    let invalid = |reason: String| GatewayError::InvalidResponse {
        provider: Provider::Gmail.to_string(),
        reason,
    };

    let to = original
        .header("From")
        .and_then(first_mailbox)
        .ok_or_else(|| invalid(format!("message {} has no usable From header", original.id)))?;
    let from = original
        .header("To")
        .and_then(first_mailbox)
        .ok_or_else(|| invalid(format!("message {} has no usable To header", original.id)))?;

    let mut builder = lettre::Message::builder()
        .from(from)
        .to(to)
        .subject(subject);
    if let Some(message_id) = original.header("Message-ID") {
        builder = builder
            .in_reply_to(message_id.to_string())
            .references(message_id.to_string());
    }

    let email = builder
        .body(body.to_string())
        .map_err(|e| invalid(format!("failed to build reply: {e}")))?;
    Ok(BASE64_URL_SAFE_NO_PAD.encode(email.formatted()))
}

#[async_trait]
impl MailboxGateway for GmailGateway {
    fn provider(&self) -> Provider {
        Provider::Gmail
    }

    async fn list_unread(
        &self,
        token: &AccessToken,
        target: &str,
    ) -> Result<Vec<Message>, GatewayError> {
        let mut url = self.url(&["messages"]);
        url.query_pairs_mut()
            .append_pair("q", "is:unread")
            .append_pair("labelIds", target)
            .append_pair("maxResults", &self.list_limit.to_string());
        let list: MessageListResponse = self.get_json(token, url, "messages.list").await?;

        if list.messages.is_empty() {
            return Ok(Vec::new());
        }

        let names: HashMap<String, String> = self
            .list_labels(token)
            .await?
            .into_iter()
            .map(|l| (l.id, l.name))
            .collect();

        let mut messages = Vec::with_capacity(list.messages.len());
        for entry in list.messages {
            // Deleted or moved since the list call; the rest are still worth triaging.
            match self.get_metadata(token, &entry.id).await {
                Ok(raw) => messages.push(to_message(raw, &names)),
                Err(e @ GatewayError::NotFound { .. }) => {
                    warn!(
                        provider = %Provider::Gmail,
                        message_id = %entry.id,
                        failure_kind = "not_found",
                        error = %e,
                        "Listed message vanished, skipping"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        debug!(target, count = messages.len(), "Listed Gmail messages");
        Ok(messages)
    }

    async fn apply_label(
        &self,
        token: &AccessToken,
        message_id: &str,
        label: &TriageLabel,
    ) -> Result<(), GatewayError> {
        let label_id = self.ensure_label(token, label.display_name()).await?;

        let response = self
            .client
            .post(self.url(&["messages", message_id, "modify"]))
            .header(AUTHORIZATION, Self::bearer(token))
            .json(&ModifyRequest {
                add_label_ids: vec![label_id],
                remove_label_ids: TRIAGED_REMOVE_LABELS.iter().map(|s| s.to_string()).collect(),
            })
            .send()
            .await
            .map_err(|e| transport_error(Provider::Gmail, e))?;
        check_status(Provider::Gmail, &format!("message {message_id}"), response).await?;

        debug!(message_id, label = %label, "Applied Gmail label");
        Ok(())
    }

    async fn send_reply(
        &self,
        token: &AccessToken,
        message_id: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), GatewayError> {
        let original = self.get_metadata(token, message_id).await?;
        let raw = encode_reply(&original, subject, body)?;

        let response = self
            .client
            .post(self.url(&["messages", "send"]))
            .header(AUTHORIZATION, Self::bearer(token))
            .json(&SendRequest {
                raw,
                thread_id: original.thread_id.clone(),
            })
            .send()
            .await
            .map_err(|e| transport_error(Provider::Gmail, e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(Provider::Gmail, status, "messages.send", &text));
        }

        info!(message_id, "Sent Gmail reply");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_message(headers: &[(&str, &str)], label_ids: &[&str]) -> GmailMessage {
        GmailMessage {
            id: "18c2".into(),
            thread_id: Some("t-1".into()),
            label_ids: label_ids.iter().map(|s| s.to_string()).collect(),
            snippet: Some("Can you send pricing and a demo?".into()),
            payload: Some(GmailPayload {
                headers: headers
                    .iter()
                    .map(|(n, v)| GmailHeader {
                        name: n.to_string(),
                        value: v.to_string(),
                    })
                    .collect(),
            }),
        }
    }

    #[test]
    fn missing_headers_get_placeholders() {
        let msg = to_message(raw_message(&[], &["INBOX", "UNREAD"]), &HashMap::new());
        assert_eq!(msg.subject, "No Subject");
        assert_eq!(msg.sender, "Unknown Sender");
        assert_eq!(msg.recipient, "Unknown Recipient");
        assert!(!msg.is_read);
        assert_eq!(msg.thread_id.as_deref(), Some("t-1"));
    }

    #[test]
    fn label_ids_resolve_to_names() {
        let names = HashMap::from([("Label_7".to_string(), "Interested".to_string())]);
        let msg = to_message(raw_message(&[], &["INBOX", "Label_7"]), &names);
        assert!(msg.is_read);
        assert_eq!(msg.labels, vec!["INBOX", "Interested"]);
        assert!(msg.has_triage_label());
    }

    #[test]
    fn reply_is_addressed_back_to_sender() {
        let original = raw_message(
            &[
                ("Subject", "Pricing?"),
                ("From", "Lead <lead@example.com>"),
                ("To", "sales@example.com, other@example.com"),
                ("Message-ID", "<abc@mail.example.com>"),
            ],
            &["UNREAD"],
        );
        let raw = encode_reply(&original, "Re: Pricing?", "Thanks!").unwrap();
        let decoded = String::from_utf8(BASE64_URL_SAFE_NO_PAD.decode(raw).unwrap()).unwrap();

        assert!(decoded.contains("To: \"Lead\" <lead@example.com>") || decoded.contains("To: Lead <lead@example.com>"));
        assert!(decoded.contains("From: sales@example.com"));
        assert!(decoded.contains("Subject: Re: Pricing?"));
        assert!(decoded.contains("In-Reply-To: <abc@mail.example.com>"));
        assert!(decoded.contains("References: <abc@mail.example.com>"));
        assert!(decoded.contains("Thanks!"));
    }

    #[test]
    fn reply_without_sender_is_rejected() {
        let original = raw_message(&[("To", "sales@example.com")], &[]);
        assert!(matches!(
            encode_reply(&original, "Re: x", "body"),
            Err(GatewayError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn first_mailbox_skips_blanks() {
        assert_eq!(
            first_mailbox(" , a@x.com, b@y.com").unwrap().email.to_string(),
            "a@x.com"
        );
        assert!(first_mailbox("Unknown Sender").is_none());
    }

    #[test]
    fn first_mailbox_keeps_quoted_commas() {
        let mailbox = first_mailbox("\"Doe, Jane\" <jane@example.com>, bob@y.com").unwrap();
        assert_eq!(mailbox.email.to_string(), "jane@example.com");
        assert_eq!(mailbox.name.as_deref(), Some("Doe, Jane"));
        assert_eq!(
            split_addresses("\"Doe, Jane\" <jane@example.com>, bob@y.com"),
            vec!["\"Doe, Jane\" <jane@example.com>", " bob@y.com"]
        );
    }

    #[test]
    fn reply_to_sender_with_comma_in_name() {
        let raw = raw_message(
            &[
                ("From", "\"Doe, Jane\" <jane@example.com>"),
                ("To", "sales@example.com"),
                ("Subject", "Pricing?"),
            ],
            &["INBOX"],
        );
        let encoded = encode_reply(&raw, "Re: Pricing?", "Thanks!").unwrap();
        let decoded = String::from_utf8(BASE64_URL_SAFE_NO_PAD.decode(encoded).unwrap()).unwrap();
        assert!(decoded.contains("jane@example.com"), "{decoded}");
    }
}
