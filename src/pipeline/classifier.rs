//! Intent classification through the model boundary.
//!
//! Two calls:
//! - `classify`: plain text, answer matched against the known labels
//! - `classify_with_reply`: structured, `{label, reply: {subject, body}}`

use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::error::ClassifyError;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::composer;
use crate::pipeline::types::{Classification, EmailContent, ReplyDraft, TriageLabel};

/// Plain label answers are a few words.
const LABEL_MAX_TOKENS: u32 = 32;

const STRUCTURED_MAX_TOKENS: u32 = 512;

const CLASSIFY_TEMPERATURE: f32 = 0.0;

const STRUCTURED_TEMPERATURE: f32 = 0.3;

const LABEL_PROMPT: &str =
    r#"Classify the following email snippet as "Interested", "Not Interested", or "More Information". Answer with the label only."#;

const STRUCTURED_PROMPT: &str = r#"You categorize incoming emails and draft a reply to each one.

Categorize the email into exactly one of: "Interested", "Not Interested", or "More Information".

- "Interested": the sender shows interest in the product or service and asks for details such as pricing or a demo.
- "Not Interested": the sender explicitly declines or says the product is not relevant.
- "More Information": the sender is interested but wants additional information first, such as a free trial or a demonstration.

Respond with ONLY a JSON object in this format:
{
  "label": "",
  "reply": {
    "subject": "",
    "body": ""
  }
}

Example: if the email shows interest and asks for a demo, the reply asks whether the sender is available for a demo call:
{
  "label": "Interested",
  "reply": {
    "subject": "Schedule a Demo Call",
    "body": "Hello! Thank you for reaching out. We're glad to hear you're interested in our product. Could you please let us know your availability for a demo call?"
  }
}"#;

#[derive(Debug, Deserialize)]
struct RawClassification {
    label: Option<String>,
    reply: Option<RawReply>,
}

#[derive(Debug, Deserialize)]
struct RawReply {
    subject: Option<String>,
    body: Option<String>,
}

/// Classifies email content with a language model.
pub struct Classifier {
    llm: Arc<dyn LlmProvider>,
    // Checked in order; "not interested" must win over "interested".
    patterns: Vec<(Regex, TriageLabel)>,
}

impl Classifier {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        let patterns = vec![
            (
                Regex::new(r"(?i)\bnot\s+interested\b").expect("static pattern"),
                TriageLabel::NotInterested,
            ),
            (
                Regex::new(r"(?i)\bmore\s+information\b").expect("static pattern"),
                TriageLabel::MoreInformation,
            ),
            (
                Regex::new(r"(?i)\binterested\b").expect("static pattern"),
                TriageLabel::Interested,
            ),
        ];
        Self { llm, patterns }
    }

    /// Plain classification of a snippet into one of the known labels.
    pub async fn classify(&self, snippet: &str) -> Result<TriageLabel, ClassifyError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(LABEL_PROMPT),
            ChatMessage::user(snippet),
        ])
        .with_temperature(CLASSIFY_TEMPERATURE)
        .with_max_tokens(LABEL_MAX_TOKENS);

        let response = self.llm.complete(request).await?;
        let label = self.match_label(&response.content)?;
        debug!(label = %label, model = self.llm.model_name(), "Classified snippet");
        Ok(label)
    }

    /// Structured classification: label plus a drafted reply.
    pub async fn classify_with_reply(
        &self,
        email: &EmailContent,
    ) -> Result<Classification, ClassifyError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(STRUCTURED_PROMPT),
            ChatMessage::user(render_email(email)),
        ])
        .with_temperature(STRUCTURED_TEMPERATURE)
        .with_max_tokens(STRUCTURED_MAX_TOKENS);

        let response = self.llm.complete(request).await?;
        let classification = parse_classification(&response.content, &email.subject)?;
        debug!(label = %classification.label, model = self.llm.model_name(), "Classified email with reply");
        Ok(classification)
    }

    fn match_label(&self, answer: &str) -> Result<TriageLabel, ClassifyError> {
        self.patterns
            .iter()
            .find(|(re, _)| re.is_match(answer))
            .map(|(_, label)| label.clone())
            .ok_or_else(|| ClassifyError::Parse(format!("no known label in {:?}", truncate(answer, 80))))
    }
}

fn render_email(email: &EmailContent) -> String {
    format!(
        "From: {}\nTo: {}\nSubject: {}\n\n{}",
        email.sender, email.recipient, email.subject, email.body
    )
}

/// Parse a structured answer. A blank reply subject falls back to
/// `Re: <original subject>`.
pub fn parse_classification(
    text: &str,
    original_subject: &str,
) -> Result<Classification, ClassifyError> {
    let json = extract_json_object(text);
    let raw: RawClassification = serde_json::from_str(&json)
        .map_err(|e| ClassifyError::Parse(format!("invalid JSON ({e}): {}", truncate(text, 80))))?;

    let label = raw
        .label
        .as_deref()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .ok_or_else(|| ClassifyError::Parse("missing label".to_string()))?;
    let label = TriageLabel::from_display_name(label)
        .unwrap_or_else(|| TriageLabel::Other(label.to_string()));

    let reply = raw
        .reply
        .ok_or_else(|| ClassifyError::Parse("missing reply".to_string()))?;
    let body = reply
        .body
        .filter(|b| !b.trim().is_empty())
        .ok_or_else(|| ClassifyError::Parse("empty reply body".to_string()))?;
    let subject = reply
        .subject
        .filter(|s| !s.trim().is_empty())
        .or_else(|| composer::reply_subject(original_subject))
        .unwrap_or_else(|| composer::compose(&label).subject);

    Ok(Classification {
        label,
        reply: ReplyDraft { subject, body },
    })
}

/// Pull a JSON object out of text that may wrap it in markdown or prose.
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
