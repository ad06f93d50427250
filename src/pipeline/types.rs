//! Shared types for the triage pipeline.

use std::fmt;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::queue::{QueueJob, QueueName};

// ── Provider & credentials ──────────────────────────────────────────

/// Mailbox provider tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Provider {
    Gmail,
    Outlook,
}

impl Provider {
    /// Short lowercase name for logs and dedupe keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gmail => "gmail",
            Self::Outlook => "outlook",
        }
    }

    /// Default mailbox target when a job names none.
    pub fn default_target(&self) -> &'static str {
        match self {
            Self::Gmail => "INBOX",
            Self::Outlook => "inbox",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque OAuth bearer token, supplied by the authorization layer.
///
/// Redacted in `Debug`. Serialized in clear text only so it can ride along
/// in a job payload.
#[derive(Clone)]
pub struct AccessToken(SecretString);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(SecretString::from(token.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    /// Short SHA-256 digest of the token, safe to store and log.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.expose().as_bytes());
        hex::encode(&hasher.finalize()[..8])
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken([REDACTED])")
    }
}

impl PartialEq for AccessToken {
    fn eq(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }
}

impl Serialize for AccessToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.expose())
    }
}

impl<'de> Deserialize<'de> for AccessToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

// ── Message ─────────────────────────────────────────────────────────

/// A mailbox message, normalized by the gateway adapter.
///
/// Never mutated locally; the provider mailbox is the system of record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Provider-native message id.
    pub id: String,
    pub provider: Provider,
    pub subject: String,
    /// Sender address (may include a display name).
    pub sender: String,
    /// First recipient address.
    pub recipient: String,
    /// Snippet or body preview.
    pub body: String,
    pub is_read: bool,
    /// Provider thread/conversation id.
    pub thread_id: Option<String>,
    /// RFC 5322 Message-ID header, when the provider exposes it.
    pub internet_message_id: Option<String>,
    /// Display names of labels/categories already on the message.
    pub labels: Vec<String>,
}

impl Message {
    /// Placeholders for missing headers.
    pub const NO_SUBJECT: &'static str = "No Subject";
    pub const UNKNOWN_SENDER: &'static str = "Unknown Sender";
    pub const UNKNOWN_RECIPIENT: &'static str = "Unknown Recipient";

    /// Whether any attached label is one of ours.
    pub fn has_triage_label(&self) -> bool {
        self.labels
            .iter()
            .any(|l| TriageLabel::from_display_name(l).is_some())
    }

    /// Extract the fields a reply job needs.
    pub fn content(&self) -> EmailContent {
        EmailContent {
            subject: self.subject.clone(),
            body: self.body.clone(),
            sender: self.sender.clone(),
            recipient: self.recipient.clone(),
        }
    }
}

/// The message fields a reply job carries, already extracted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailContent {
    pub subject: String,
    pub body: String,
    pub sender: String,
    pub recipient: String,
}

// ── Triage label ────────────────────────────────────────────────────

/// Intent category produced by the classifier and applied as a provider label.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TriageLabel {
    Interested,
    NotInterested,
    MoreInformation,
    /// A label outside the known set, as returned by a structured call.
    Other(String),
}

impl TriageLabel {
    /// All known labels.
    pub const KNOWN: [TriageLabel; 3] = [
        TriageLabel::Interested,
        TriageLabel::NotInterested,
        TriageLabel::MoreInformation,
    ];

    /// Name used for the provider label/category.
    pub fn display_name(&self) -> &str {
        match self {
            Self::Interested => "Interested",
            Self::NotInterested => "Not Interested",
            Self::MoreInformation => "More Information",
            Self::Other(name) => name,
        }
    }

    /// Match a provider label name against the known set.
    pub fn from_display_name(name: &str) -> Option<Self> {
        let normalized: String = name
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        match normalized.as_str() {
            "interested" => Some(Self::Interested),
            "not interested" | "notinterested" => Some(Self::NotInterested),
            "more information" | "moreinformation" => Some(Self::MoreInformation),
            _ => None,
        }
    }

    /// Everything except `NotInterested` gets a reply.
    pub fn warrants_reply(&self) -> bool {
        !matches!(self, Self::NotInterested)
    }
}

impl fmt::Display for TriageLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

// ── Replies ─────────────────────────────────────────────────────────

/// Reply subject and body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyDraft {
    pub subject: String,
    pub body: String,
}

/// Result of a structured classification: label and reply together.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub label: TriageLabel,
    pub reply: ReplyDraft,
}

// ── Jobs ────────────────────────────────────────────────────────────

/// "Process this mailbox" job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessJob {
    pub provider: Provider,
    pub access_token: AccessToken,
    /// Gmail label id or Outlook folder id. Provider default when `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl ProcessJob {
    pub fn target(&self) -> &str {
        self.target
            .as_deref()
            .unwrap_or_else(|| self.provider.default_target())
    }
}

impl QueueJob for ProcessJob {
    const QUEUE: QueueName = QueueName::Process;

    // One outstanding run per mailbox; scheduler ticks pile up otherwise.
    // The token fingerprint tells accounts on the same provider apart.
    fn dedupe_key(&self) -> Option<String> {
        Some(format!(
            "process:{}:{}:{}",
            self.provider,
            self.access_token.fingerprint(),
            self.target()
        ))
    }
}

/// "Reply to this message" job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyJob {
    pub provider: Provider,
    pub message_id: String,
    pub access_token: AccessToken,
    pub email: EmailContent,
}

impl QueueJob for ReplyJob {
    const QUEUE: QueueName = QueueName::Reply;

    fn dedupe_key(&self) -> Option<String> {
        Some(format!("reply:{}:{}", self.provider, self.message_id))
    }
}
