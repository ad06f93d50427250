//! Template replies for classified messages.

use crate::pipeline::types::{ReplyDraft, TriageLabel};

const INTERESTED_SUBJECT: &str = "Thank you for your interest";
const INTERESTED_BODY: &str = "Thank you for your interest. We would be happy to provide more information about our products/services.";

const MORE_INFORMATION_SUBJECT: &str = "More information on your inquiry";
const MORE_INFORMATION_BODY: &str = "We appreciate your inquiry. We'd be glad to provide additional information. What specific details are you looking for?";

const DEFAULT_SUBJECT: &str = "Thank you for your email";
const DEFAULT_BODY: &str = "Thank you for your email. We have received your message and will get back to you if necessary.";

/// Fixed reply for a label. Unrecognized labels get the default template.
pub fn compose(label: &TriageLabel) -> ReplyDraft {
    let (subject, body) = match label {
        TriageLabel::Interested => (INTERESTED_SUBJECT, INTERESTED_BODY),
        TriageLabel::MoreInformation => (MORE_INFORMATION_SUBJECT, MORE_INFORMATION_BODY),
        TriageLabel::NotInterested | TriageLabel::Other(_) => (DEFAULT_SUBJECT, DEFAULT_BODY),
    };
    ReplyDraft {
        subject: subject.to_string(),
        body: body.to_string(),
    }
}

/// Template body, threaded under the original subject.
pub fn compose_reply(label: &TriageLabel, original_subject: &str) -> ReplyDraft {
    let draft = compose(label);
    match reply_subject(original_subject) {
        Some(subject) => ReplyDraft {
            subject,
            body: draft.body,
        },
        None => draft,
    }
}

/// `Re: <subject>`, unless it already is one. `None` for a blank subject.
pub fn reply_subject(original: &str) -> Option<String> {
    let trimmed = original.trim();
    if trimmed.is_empty() {
        return None;
    }
    let already_reply = trimmed
        .get(..3)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("re:"));
    if already_reply {
        Some(trimmed.to_string())
    } else {
        Some(format!("Re: {trimmed}"))
    }
}
