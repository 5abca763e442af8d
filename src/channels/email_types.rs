//! Email-specific types: inbound message metadata, attachments, address helpers.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A file that arrived with an inbound message, already saved to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundAttachment {
    pub filename: String,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// Everything the assistant knows about one inbound message.
///
/// Serialized as `email.json` next to the archived attachments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMeta {
    /// Stable local identifier (archive directory name).
    pub id: String,
    /// Sender address.
    pub from: String,
    /// To recipients.
    #[serde(default)]
    pub to: Vec<String>,
    pub subject: String,
    pub date: DateTime<Utc>,
    /// Message-ID header, empty when the message had none.
    #[serde(default)]
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<String>,
    /// Plain-text body.
    #[serde(default)]
    pub text: String,
    /// HTML body, when the message had one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(default)]
    pub attachments: Vec<InboundAttachment>,
    /// Archive directory holding this message's files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kb_dir: Option<PathBuf>,
}

impl MessageMeta {
    /// A minimal message, as used by the manual trigger.
    pub fn new(
        from: impl Into<String>,
        subject: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            from: from.into(),
            to: Vec::new(),
            subject: subject.into(),
            date: Utc::now(),
            message_id: String::new(),
            in_reply_to: None,
            references: Vec::new(),
            text: text.into(),
            html: None,
            attachments: Vec::new(),
            kb_dir: None,
        }
    }

    /// Attach HTML content.
    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html = Some(html.into());
        self
    }

    /// Attach an on-disk file.
    pub fn with_attachment(mut self, attachment: InboundAttachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// HTML body, if non-empty.
    pub fn html_body(&self) -> Option<&str> {
        self.html.as_deref().filter(|h| !h.trim().is_empty())
    }

    /// Whether `marker` appears in the subject, text or HTML body.
    pub fn mentions(&self, marker: &str) -> bool {
        if marker.is_empty() {
            return false;
        }
        self.subject.contains(marker)
            || self.text.contains(marker)
            || self.html.as_deref().is_some_and(|h| h.contains(marker))
    }
}

/// Extract email addresses from an optional mail_parser Address field.
///
/// Returns an empty vec if the address is None.
pub fn extract_addresses(addr: Option<&mail_parser::Address>) -> Vec<String> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    match addr {
        mail_parser::Address::List(addrs) => addrs
            .iter()
            .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            .collect(),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| {
                g.addresses
                    .iter()
                    .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            })
            .collect(),
    }
}

/// Replace anything outside `[A-Za-z0-9._-]` with `_`.
pub fn safe_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    // A name made only of dots would escape the directory.
    if cleaned.chars().all(|c| c == '.') {
        cleaned.replace('.', "_")
    } else {
        cleaned
    }
}

/// Reply subject with exactly one `Re:` prefix.
pub fn reply_subject(subject: &str) -> String {
    let trimmed = subject.trim();
    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("re:") {
        trimmed.to_string()
    } else if trimmed.is_empty() {
        "Re:".to_string()
    } else {
        format!("Re: {trimmed}")
    }
}
