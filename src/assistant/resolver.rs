//! Turning a [`ReplyPlan`] into the body and attachments of the outgoing mail.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs;

use crate::assistant::markdown::render_document;
use crate::assistant::plan::{AttachmentRef, NO_REPLY, ReplyFormat, ReplyPlan};
use crate::assistant::workspace::{SessionWorkspace, names};
use crate::error::PlanError;

/// Final reply content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolvedReply {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    pub attachments: Vec<AttachmentRef>,
}

impl ResolvedReply {
    /// The "send nothing" result.
    pub fn no_reply() -> Self {
        Self {
            text: NO_REPLY.to_string(),
            html: None,
            attachments: Vec::new(),
        }
    }

    pub fn is_no_reply(&self) -> bool {
        self.text.trim() == NO_REPLY
    }
}

/// Resolve a plan against the session directory. Never fails.
///
/// `answer` is the agent's result string; it becomes the reply text when a
/// structured plan cannot be honored.
pub async fn resolve(
    plan: ReplyPlan,
    answer: &str,
    workspace: &mut SessionWorkspace,
) -> ResolvedReply {
    match plan {
        ReplyPlan::NoReply => ResolvedReply::no_reply(),
        ReplyPlan::StructuredReply {
            reply_file,
            format,
            attachments,
        } => match resolve_structured(&reply_file, format, &attachments, workspace).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(error = %e, "Reply plan not usable, falling back to raw answer");
                resolve_raw(answer, workspace).await
            }
        },
        ReplyPlan::RawText { text } => resolve_raw(&text, workspace).await,
    }
}

async fn resolve_structured(
    reply_file: &Path,
    declared: ReplyFormat,
    attachments: &[AttachmentRef],
    workspace: &SessionWorkspace,
) -> Result<ResolvedReply, PlanError> {
    let path = absolutize(reply_file, workspace.dir());
    let content = fs::read_to_string(&path)
        .await
        .map_err(|source| PlanError::UnreadableReplyFile {
            path: path.clone(),
            source,
        })?;

    let (text, html) = match ReplyFormat::from_path(&path).unwrap_or(declared) {
        ReplyFormat::Html => (String::new(), Some(content)),
        ReplyFormat::Md => {
            let html = render_document(&content);
            (content, Some(html))
        }
        ReplyFormat::Txt => (content, None),
    };

    let reply_base = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let declared = normalize_attachments(attachments, workspace.dir()).await;
    let generated = workspace.generated_files(&[reply_base.as_str()]).await;
    let attachments = merge_attachments(declared, generated);

    tracing::debug!(
        reply_file = %path.display(),
        attachments = attachments.len(),
        "Resolved structured reply"
    );
    Ok(ResolvedReply {
        text,
        html,
        attachments,
    })
}

async fn resolve_raw(text: &str, workspace: &mut SessionWorkspace) -> ResolvedReply {
    if let Err(e) = workspace.write(names::REPLY_TEXT, text).await {
        tracing::warn!(error = %e, "Failed to save raw reply text");
    }

    let html_file = workspace
        .read_optional(names::REPLY_HTML)
        .await
        .filter(|s| !s.is_empty());
    let md_file = workspace
        .read_optional(names::REPLY_MD)
        .await
        .filter(|s| !s.is_empty());

    let html = html_file.or_else(|| md_file.as_deref().map(render_document));
    let text = md_file.unwrap_or_else(|| text.to_string());
    let attachments = workspace.generated_files(&[]).await;

    tracing::debug!(attachments = attachments.len(), "Resolved raw reply");
    ResolvedReply {
        text,
        html,
        attachments,
    }
}

/// Keep entries that point at an existing regular file, with a filename
/// filled in and duplicates removed. Relative paths are taken from `base`.
pub async fn normalize_attachments(items: &[AttachmentRef], base: &Path) -> Vec<AttachmentRef> {
    let mut out = Vec::new();
    for item in items {
        if item.path.as_os_str().is_empty() {
            continue;
        }
        let path = absolutize(&item.path, base);
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => {
                tracing::debug!(path = %path.display(), "Declared attachment is not a file");
                continue;
            }
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Declared attachment missing");
                continue;
            }
        }
        let mut normalized = AttachmentRef {
            path,
            filename: None,
            content_type: item.content_type.clone(),
        };
        normalized.filename = Some(
            item.filename
                .clone()
                .filter(|f| !f.is_empty())
                .unwrap_or_else(|| normalized.display_name()),
        );
        out.push(normalized);
    }
    dedup(out)
}

/// `primary` then `secondary`, deduplicated by path (or filename), first wins.
pub fn merge_attachments(
    primary: Vec<AttachmentRef>,
    secondary: Vec<AttachmentRef>,
) -> Vec<AttachmentRef> {
    dedup(primary.into_iter().chain(secondary).collect())
}

fn dedup(items: Vec<AttachmentRef>) -> Vec<AttachmentRef> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|a| seen.insert(a.dedup_key()))
        .collect()
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::plan::parse_plan;
    use crate::channels::email_types::MessageMeta;
    use tempfile::TempDir;

    async fn workspace(tmp: &TempDir) -> SessionWorkspace {
        let msg = MessageMeta::new("bob@example.com", "hello", "body");
        SessionWorkspace::prepare(tmp.path().join("session"), &msg, "prompt")
            .await
            .unwrap()
    }

    fn attachment(path: &Path) -> AttachmentRef {
        AttachmentRef::new(path)
    }

    #[tokio::test]
    async fn no_reply_has_nothing() {
        let tmp = TempDir::new().unwrap();
        let mut ws = workspace(&tmp).await;
        std::fs::write(ws.path("stray.txt"), "x").unwrap();

        let reply = resolve(ReplyPlan::NoReply, "NO_REPLY", &mut ws).await;
        assert!(reply.is_no_reply());
        assert!(reply.html.is_none());
        assert!(reply.attachments.is_empty());
    }

    #[tokio::test]
    async fn markdown_reply_file() {
        let tmp = TempDir::new().unwrap();
        let mut ws = workspace(&tmp).await;
        let reply_path = ws.path("reply_email.md");
        std::fs::write(&reply_path, "Hello **world**").unwrap();

        let answer = format!(
            r#"{{"reply":"REPLY","reply_file":"{}","format":"md","attachments":[]}}"#,
            reply_path.display()
        );
        let plan = parse_plan(&answer);
        let reply = resolve(plan, &answer, &mut ws).await;

        assert_eq!(reply.text, "Hello **world**");
        assert!(reply.html.as_deref().unwrap().contains("<strong>world</strong>"));
        assert!(reply.attachments.is_empty());
    }

    #[tokio::test]
    async fn html_reply_file_has_empty_text() {
        let tmp = TempDir::new().unwrap();
        let mut ws = workspace(&tmp).await;
        std::fs::write(ws.path("answer.html"), "<p>hi</p>").unwrap();

        let plan = ReplyPlan::StructuredReply {
            reply_file: PathBuf::from("answer.html"),
            format: ReplyFormat::Txt,
            attachments: vec![],
        };
        let reply = resolve(plan, "ignored", &mut ws).await;
        assert_eq!(reply.text, "");
        assert_eq!(reply.html.as_deref(), Some("<p>hi</p>"));
        // The reply file itself is never an attachment.
        assert!(reply.attachments.is_empty());
    }

    #[tokio::test]
    async fn declared_format_used_for_unknown_extension() {
        let tmp = TempDir::new().unwrap();
        let mut ws = workspace(&tmp).await;
        std::fs::write(ws.path("body.out"), "# Heading").unwrap();

        let plan = ReplyPlan::StructuredReply {
            reply_file: ws.path("body.out"),
            format: ReplyFormat::Md,
            attachments: vec![],
        };
        let reply = resolve(plan, "", &mut ws).await;
        assert_eq!(reply.text, "# Heading");
        assert!(reply.html.unwrap().contains("<h1>Heading</h1>"));
    }

    #[tokio::test]
    async fn structured_reply_merges_declared_and_generated() {
        let tmp = TempDir::new().unwrap();
        let mut ws = workspace(&tmp).await;
        std::fs::write(ws.path("reply_email.txt"), "see attached").unwrap();
        std::fs::write(ws.path("a.csv"), "a").unwrap();
        std::fs::write(ws.path("b.png"), "b").unwrap();

        let plan = ReplyPlan::StructuredReply {
            reply_file: ws.path("reply_email.txt"),
            format: ReplyFormat::Txt,
            attachments: vec![
                AttachmentRef {
                    path: ws.path("b.png"),
                    filename: Some("chart.png".into()),
                    content_type: Some("image/png".into()),
                },
                attachment(&ws.path("missing.pdf")),
            ],
        };
        let reply = resolve(plan, "", &mut ws).await;

        assert_eq!(reply.text, "see attached");
        assert!(reply.html.is_none());
        let names: Vec<_> = reply.attachments.iter().map(|a| a.display_name()).collect();
        assert_eq!(names, vec!["chart.png", "a.csv"]);
        assert_eq!(reply.attachments[0].content_type.as_deref(), Some("image/png"));
    }

    #[tokio::test]
    async fn unreadable_reply_file_falls_back_to_raw_answer() {
        let tmp = TempDir::new().unwrap();
        let mut ws = workspace(&tmp).await;
        let answer = r#"{"reply":"REPLY","reply_file":"/nonexistent/reply.md"}"#;

        let reply = resolve(parse_plan(answer), answer, &mut ws).await;
        assert_eq!(reply.text, answer);
        assert!(reply.html.is_none());
        let saved = std::fs::read_to_string(ws.path("reply.txt")).unwrap();
        assert_eq!(saved, answer);
    }

    #[tokio::test]
    async fn raw_text_attaches_generated_files_only() {
        let tmp = TempDir::new().unwrap();
        let mut ws = workspace(&tmp).await;
        std::fs::write(ws.path("report.txt"), "numbers").unwrap();

        let reply = resolve(parse_plan("done"), "done", &mut ws).await;

        assert_eq!(reply.text, "done");
        assert!(reply.html.is_none());
        let names: Vec<_> = reply.attachments.iter().map(|a| a.display_name()).collect();
        assert_eq!(names, vec!["report.txt"]);
    }

    #[tokio::test]
    async fn raw_text_prefers_conventional_reply_files() {
        let tmp = TempDir::new().unwrap();
        let mut ws = workspace(&tmp).await;
        std::fs::write(ws.path("reply_email.md"), "- one\n- two").unwrap();

        let reply = resolve(parse_plan("done"), "done", &mut ws).await;
        assert_eq!(reply.text, "- one\n- two");
        assert!(reply.html.as_deref().unwrap().contains("<li>two</li>"));
        assert!(reply.attachments.is_empty());

        std::fs::write(ws.path("reply_email.html"), "<b>final</b>").unwrap();
        let reply = resolve(parse_plan("done"), "done", &mut ws).await;
        assert_eq!(reply.html.as_deref(), Some("<b>final</b>"));
        assert_eq!(reply.text, "- one\n- two");
    }

    #[tokio::test]
    async fn normalize_filters_and_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path();
        std::fs::write(base.join("a.txt"), "a").unwrap();
        std::fs::create_dir(base.join("dir")).unwrap();

        let items = vec![
            attachment(Path::new("a.txt")),
            attachment(&base.join("a.txt")),
            attachment(&base.join("dir")),
            attachment(&base.join("gone.txt")),
            attachment(Path::new("")),
        ];
        let once = normalize_attachments(&items, base).await;
        assert_eq!(once.len(), 1);
        assert_eq!(once[0].path, base.join("a.txt"));
        assert_eq!(once[0].filename.as_deref(), Some("a.txt"));

        let twice = normalize_attachments(&once, base).await;
        assert_eq!(once, twice);
    }

    #[test]
    fn merge_keeps_first_occurrence() {
        let a = attachment(Path::new("/w/A"));
        let b_declared = AttachmentRef {
            filename: Some("declared-b".into()),
            ..attachment(Path::new("/w/B"))
        };
        let b_generated = attachment(Path::new("/w/B"));
        let c = attachment(Path::new("/w/C"));

        let merged = merge_attachments(vec![a, b_declared], vec![b_generated, c]);
        let paths: Vec<_> = merged.iter().map(|x| x.path.to_str().unwrap()).collect();
        assert_eq!(paths, vec!["/w/A", "/w/B", "/w/C"]);
        assert_eq!(merged[1].filename.as_deref(), Some("declared-b"));
    }

    #[test]
    fn merge_with_no_declared_is_generated() {
        let g = vec![attachment(Path::new("/w/x")), attachment(Path::new("/w/x"))];
        let merged = merge_attachments(Vec::new(), g);
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn resolved_reply_serializes_without_empty_html() {
        let json = serde_json::to_value(ResolvedReply::no_reply()).unwrap();
        assert_eq!(json["text"], "NO_REPLY");
        assert!(json.get("html").is_none());
    }
}
