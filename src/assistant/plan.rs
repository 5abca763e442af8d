//! Interpreting the agent's final answer.
//!
//! The agent is asked to answer with either `NO_REPLY` or a small JSON plan
//! pointing at a reply file, but it is a language model and does not always
//! comply. Nothing here fails: every input maps to a [`ReplyPlan`].

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::error::ParseError;

/// Literal answer meaning "do not reply to this message".
pub const NO_REPLY: &str = "NO_REPLY";

/// Raw output kept when nothing better can be salvaged.
const MAX_RAW_CHARS: usize = 10_000;

static RESULT_STRING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""result"\s*:\s*"((?:[^"\\]|\\[\s\S])*)""#).unwrap());

/// Body format of a reply file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyFormat {
    Html,
    Md,
    Txt,
}

impl ReplyFormat {
    /// Format implied by a file extension, if recognized.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "html" | "htm" => Some(Self::Html),
            "md" | "markdown" => Some(Self::Md),
            "txt" | "text" => Some(Self::Txt),
            _ => None,
        }
    }

    /// Parse a declared `format` value.
    pub fn from_declared(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "html" | "htm" => Some(Self::Html),
            "md" | "markdown" => Some(Self::Md),
            "txt" | "text" | "plain" => Some(Self::Txt),
            _ => None,
        }
    }
}

/// A file to send along with the reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachmentRef {
    pub path: PathBuf,
    /// Name shown to the recipient; defaults to the path's basename.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(rename = "contentType", skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

impl AttachmentRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            filename: None,
            content_type: None,
        }
    }

    /// Filename for the outgoing message.
    pub fn display_name(&self) -> String {
        self.filename
            .clone()
            .filter(|f| !f.is_empty())
            .or_else(|| {
                self.path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "attachment".to_string())
    }

    /// Deduplication key: the path, or the filename when the path is empty.
    pub fn dedup_key(&self) -> String {
        if self.path.as_os_str().is_empty() {
            self.display_name()
        } else {
            self.path.to_string_lossy().into_owned()
        }
    }
}

/// What the agent asked us to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyPlan {
    /// Send nothing.
    NoReply,
    /// Read the body from `reply_file` and attach the listed files.
    StructuredReply {
        reply_file: PathBuf,
        format: ReplyFormat,
        attachments: Vec<AttachmentRef>,
    },
    /// Free-form answer, used as the reply text.
    RawText { text: String },
}

/// Parse the agent's final answer into a plan.
///
/// `NO_REPLY` (after trimming) wins; then a JSON object with
/// `"reply": "REPLY"` and a non-empty `reply_file`; anything else is raw text.
pub fn parse_plan(answer: &str) -> ReplyPlan {
    let trimmed = answer.trim();
    if trimmed == NO_REPLY {
        return ReplyPlan::NoReply;
    }

    let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(trimmed) else {
        return ReplyPlan::RawText {
            text: answer.to_string(),
        };
    };

    let is_reply = obj.get("reply").and_then(Value::as_str) == Some("REPLY");
    let reply_file = obj
        .get("reply_file")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|f| !f.is_empty());

    match reply_file {
        Some(file) if is_reply => {
            let reply_file = PathBuf::from(file);
            let format = obj
                .get("format")
                .and_then(Value::as_str)
                .and_then(ReplyFormat::from_declared)
                .or_else(|| ReplyFormat::from_path(&reply_file))
                .unwrap_or(ReplyFormat::Txt);
            let attachments = obj
                .get("attachments")
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(attachment_from_value).collect())
                .unwrap_or_default();
            ReplyPlan::StructuredReply {
                reply_file,
                format,
                attachments,
            }
        }
        _ => ReplyPlan::RawText {
            text: answer.to_string(),
        },
    }
}

fn attachment_from_value(value: &Value) -> Option<AttachmentRef> {
    let path = value.get("path")?.as_str()?.trim();
    if path.is_empty() {
        return None;
    }
    let text_field = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
    };
    Some(AttachmentRef {
        path: PathBuf::from(path),
        filename: text_field("filename"),
        content_type: text_field("contentType").or_else(|| text_field("content_type")),
    })
}

/// Pull the final `result` string out of the agent's stdout.
///
/// Accepts a single JSON object, a JSON array of records, or concatenated
/// records; the last record with `"type": "result"` wins, else the last
/// record. When the output is not JSON (typically because the process was
/// cut off mid-record) the `result` string is salvaged by regex, and failing
/// that the head of the raw output is used.
pub fn extract_answer(stdout: &str) -> String {
    match extract_result(stdout) {
        Ok(answer) => answer,
        Err(e) => {
            tracing::warn!(error = %e, "Agent output is not clean JSON, salvaging result text");
            salvage_result(stdout)
        }
    }
}

/// Strict extraction over well-formed JSON records.
pub fn extract_result(stdout: &str) -> Result<String, ParseError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(ParseError::Empty);
    }

    let mut records = Vec::new();
    let mut failure = None;
    for item in serde_json::Deserializer::from_str(trimmed).into_iter::<Value>() {
        match item {
            Ok(Value::Array(items)) => records.extend(items),
            Ok(value) => records.push(value),
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }

    let terminal = records
        .iter()
        .rev()
        .find(|r| r.get("type").and_then(Value::as_str) == Some("result"));

    let chosen = match (terminal, failure) {
        (Some(record), _) => record,
        (None, Some(e)) => return Err(ParseError::Json(e)),
        (None, None) => match records.last() {
            Some(record) => record,
            // `[]`: well-formed, nothing said.
            None => return Ok(String::new()),
        },
    };

    Ok(result_text(chosen).trim().to_string())
}

fn result_text(record: &Value) -> String {
    match record.get("result") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// Best-effort recovery of a `"result": "..."` string from broken output.
pub fn salvage_result(stdout: &str) -> String {
    if let Some(caps) = RESULT_STRING.captures(stdout) {
        let raw = &caps[1];
        // Still JSON-escaped.
        return serde_json::from_str::<String>(&format!("\"{raw}\""))
            .unwrap_or_else(|_| raw.to_string())
            .trim()
            .to_string();
    }
    stdout.trim().chars().take(MAX_RAW_CHARS).collect()
}
