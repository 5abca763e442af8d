//! Maildir inbound source.
//!
//! Mail is delivered into `<maildir>/new` by an external fetcher (fetchmail,
//! mbsync, an MTA). Each poll parses every file there, archives it under the
//! knowledge-base directory and moves it to `cur/` so it is never read twice.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mail_parser::{HeaderValue, MessageParser, MimeHeaders, PartType};

use crate::channels::email_types::{
    InboundAttachment, MessageMeta, extract_addresses, safe_file_name,
};
use crate::error::ChannelError;
use crate::pipeline::types::MailSource;

/// Reads and archives messages from a Maildir spool.
#[derive(Debug, Clone)]
pub struct MaildirSource {
    maildir: PathBuf,
    kb_dir: PathBuf,
}

impl MaildirSource {
    pub fn new(maildir: impl Into<PathBuf>, kb_dir: impl Into<PathBuf>) -> Self {
        Self {
            maildir: maildir.into(),
            kb_dir: kb_dir.into(),
        }
    }
}

#[async_trait]
impl MailSource for MaildirSource {
    fn name(&self) -> &str {
        "maildir"
    }

    async fn fetch_new(&self) -> Result<Vec<MessageMeta>, ChannelError> {
        let maildir = self.maildir.clone();
        let kb_dir = self.kb_dir.clone();
        tokio::task::spawn_blocking(move || drain_new(&maildir, &kb_dir))
            .await
            .map_err(|e| ChannelError::FetchFailed {
                name: "maildir".into(),
                reason: format!("Maildir task panicked: {e}"),
            })?
    }
}

/// Parse, archive and mark seen every message in `new/` (blocking).
fn drain_new(maildir: &Path, kb_dir: &Path) -> Result<Vec<MessageMeta>, ChannelError> {
    let new_dir = maildir.join("new");
    let entries = std::fs::read_dir(&new_dir).map_err(|e| ChannelError::FetchFailed {
        name: "maildir".into(),
        reason: format!("Cannot read {}: {e}", new_dir.display()),
    })?;

    let mut files: Vec<(String, PathBuf)> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
        .map(|entry| (entry.file_name().to_string_lossy().into_owned(), entry.path()))
        .filter(|(name, _)| !name.starts_with('.'))
        .collect();
    // Maildir names start with a delivery timestamp.
    files.sort();

    let mut messages = Vec::new();
    for (name, path) in files {
        match std::fs::read(&path) {
            Ok(raw) => match archive_message(&raw, &name, kb_dir) {
                Ok(meta) => {
                    tracing::info!(
                        id = %meta.id,
                        from = %meta.from,
                        subject = %meta.subject,
                        attachments = meta.attachments.len(),
                        "Archived inbound message"
                    );
                    messages.push(meta);
                }
                Err(e) => tracing::warn!(file = %name, error = %e, "Skipping unparseable message"),
            },
            Err(e) => {
                tracing::warn!(file = %name, error = %e, "Failed to read message file");
                continue;
            }
        }

        if let Err(e) = mark_seen(maildir, &path, &name) {
            tracing::warn!(file = %name, error = %e, "Failed to move message to cur/");
        }
    }

    Ok(messages)
}

/// Move `new/<name>` to `cur/<name>:2,S`.
fn mark_seen(maildir: &Path, path: &Path, name: &str) -> std::io::Result<()> {
    std::fs::rename(path, maildir.join("cur").join(seen_name(name)))
}

fn seen_name(name: &str) -> String {
    let base = name.split_once(':').map_or(name, |(base, _)| base);
    format!("{base}:2,S")
}

/// Parse one RFC 5322 message and write its archive directory.
pub fn archive_message(
    raw: &[u8],
    file_name: &str,
    kb_dir: &Path,
) -> Result<MessageMeta, ChannelError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Err(ChannelError::InvalidMessage(format!("{file_name}: empty")));
    }
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| ChannelError::InvalidMessage(format!("{file_name}: not an email")))?;

    let date = parsed
        .date()
        .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);
    let stem = file_name.split_once(':').map_or(file_name, |(base, _)| base);
    let id = format!(
        "{}-{}",
        date.format("%Y-%m-%dT%H-%M-%S-%3fZ"),
        safe_file_name(stem)
    );
    let dir = kb_dir.join(&id);
    let io_err = |e: std::io::Error| ChannelError::FetchFailed {
        name: "maildir".into(),
        reason: format!("Archive write failed in {}: {e}", dir.display()),
    };
    std::fs::create_dir_all(&dir).map_err(io_err)?;

    let from = extract_addresses(parsed.from()).into_iter().next().unwrap_or_default();
    let text = parsed
        .body_text(0)
        .map(|t| t.into_owned())
        .unwrap_or_default();
    // body_html synthesizes HTML from plain text; only keep real HTML parts.
    let html = parsed
        .html_part(0)
        .filter(|part| matches!(part.body, PartType::Html(_)))
        .and_then(|_| parsed.body_html(0))
        .map(|h| h.into_owned());

    let mut attachments = Vec::new();
    let mut used = HashSet::new();
    for (index, part) in parsed.attachments().enumerate() {
        let original = MimeHeaders::attachment_name(part)
            .map(safe_file_name)
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("attachment-{}", index + 1));
        let mut filename = original.clone();
        let mut n = 1;
        while !used.insert(filename.clone()) {
            filename = format!("{n}-{original}");
            n += 1;
        }

        let path = dir.join(&filename);
        std::fs::write(&path, part.contents()).map_err(io_err)?;
        let content_type = MimeHeaders::content_type(part).map(|ct| match ct.subtype() {
            Some(sub) => format!("{}/{}", ct.ctype(), sub),
            None => ct.ctype().to_string(),
        });
        attachments.push(InboundAttachment {
            filename,
            path,
            content_type,
        });
    }

    let meta = MessageMeta {
        id,
        from,
        to: extract_addresses(parsed.to()),
        subject: parsed.subject().unwrap_or_default().to_string(),
        date,
        message_id: parsed.message_id().unwrap_or_default().to_string(),
        in_reply_to: header_texts(parsed.in_reply_to()).into_iter().next(),
        references: header_texts(parsed.references()),
        text,
        html,
        attachments,
        kb_dir: Some(dir.clone()),
    };

    let json = serde_json::to_vec_pretty(&meta).map_err(|e| ChannelError::FetchFailed {
        name: "maildir".into(),
        reason: format!("Failed to serialize message metadata: {e}"),
    })?;
    std::fs::write(dir.join("email.json"), json).map_err(io_err)?;
    if !meta.text.is_empty() {
        std::fs::write(dir.join("email.txt"), &meta.text).map_err(io_err)?;
    }
    if let Some(html) = &meta.html {
        std::fs::write(dir.join("email.html"), html).map_err(io_err)?;
    }

    Ok(meta)
}

/// Message-ID style header values (In-Reply-To, References).
fn header_texts(value: &HeaderValue) -> Vec<String> {
    match value {
        HeaderValue::Text(t) => vec![t.to_string()],
        HeaderValue::TextList(list) => list.iter().map(|t| t.to_string()).collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PLAIN: &str = "From: Alice <alice@example.com>\r\n\
To: assistant@example.com\r\n\
Subject: Need numbers @assistant\r\n\
Date: Tue, 1 Oct 2024 09:30:00 +0000\r\n\
Message-ID: <m1@example.com>\r\n\
In-Reply-To: <m0@example.com>\r\n\
References: <root@example.com> <m0@example.com>\r\n\
\r\n\
Please send the Q3 report.\r\n";

    const WITH_ATTACHMENT: &str = "From: bob@example.com\r\n\
Subject: Data\r\n\
Message-ID: <m2@example.com>\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"XX\"\r\n\
\r\n\
--XX\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<p>See <b>attached</b></p>\r\n\
--XX\r\n\
Content-Type: text/csv\r\n\
Content-Disposition: attachment; filename=\"q3 data.csv\"\r\n\
\r\n\
a,b\r\n\
1,2\r\n\
--XX--\r\n";

    fn maildir(tmp: &TempDir) -> (PathBuf, PathBuf) {
        let md = tmp.path().join("Maildir");
        for sub in ["new", "cur", "tmp"] {
            std::fs::create_dir_all(md.join(sub)).unwrap();
        }
        (md, tmp.path().join("kb"))
    }

    #[test]
    fn archive_plain_message() {
        let tmp = TempDir::new().unwrap();
        let meta = archive_message(PLAIN.as_bytes(), "1727775000.M1P2.host", tmp.path()).unwrap();

        assert_eq!(meta.from, "alice@example.com");
        assert_eq!(meta.to, vec!["assistant@example.com"]);
        assert_eq!(meta.subject, "Need numbers @assistant");
        assert_eq!(meta.message_id, "m1@example.com");
        assert_eq!(meta.in_reply_to.as_deref(), Some("m0@example.com"));
        assert_eq!(meta.references, vec!["root@example.com", "m0@example.com"]);
        assert!(meta.text.contains("Q3 report"));
        assert!(meta.html.is_none());
        assert!(meta.id.starts_with("2024-10-01T09-30-00-000Z-"));

        let dir = meta.kb_dir.clone().unwrap();
        assert!(dir.join("email.json").is_file());
        assert!(dir.join("email.txt").is_file());
        assert!(!dir.join("email.html").exists());
    }

    #[test]
    fn archive_saves_attachments_with_safe_names() {
        let tmp = TempDir::new().unwrap();
        let meta = archive_message(WITH_ATTACHMENT.as_bytes(), "m2", tmp.path()).unwrap();

        assert!(meta.html.as_deref().unwrap().contains("<b>attached</b>"));
        assert_eq!(meta.attachments.len(), 1);
        let att = &meta.attachments[0];
        assert_eq!(att.filename, "q3_data.csv");
        assert_eq!(att.content_type.as_deref(), Some("text/csv"));
        assert!(std::fs::read_to_string(&att.path).unwrap().contains("1,2"));
    }

    #[test]
    fn seen_name_sets_flags() {
        assert_eq!(seen_name("123.abc.host"), "123.abc.host:2,S");
        assert_eq!(seen_name("123.abc.host:2,"), "123.abc.host:2,S");
    }

    #[tokio::test]
    async fn fetch_new_moves_files_to_cur() {
        let tmp = TempDir::new().unwrap();
        let (md, kb) = maildir(&tmp);
        std::fs::write(md.join("new").join("100.a.host"), PLAIN).unwrap();
        std::fs::write(md.join("new").join("200.b.host"), WITH_ATTACHMENT).unwrap();

        let source = MaildirSource::new(&md, &kb);
        let messages = source.fetch_new().await.unwrap();

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].from, "alice@example.com");
        assert_eq!(messages[1].from, "bob@example.com");
        assert_eq!(std::fs::read_dir(md.join("new")).unwrap().count(), 0);
        assert!(md.join("cur").join("100.a.host:2,S").is_file());

        // Nothing left to read on the next poll.
        assert!(source.fetch_new().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn garbage_is_moved_not_returned() {
        let tmp = TempDir::new().unwrap();
        let (md, kb) = maildir(&tmp);
        std::fs::write(md.join("new").join("300.c.host"), b"").unwrap();

        let source = MaildirSource::new(&md, &kb);
        let messages = source.fetch_new().await.unwrap();
        assert!(messages.is_empty());
        assert!(md.join("cur").join("300.c.host:2,S").is_file());
    }

    #[tokio::test]
    async fn missing_maildir_is_fetch_error() {
        let tmp = TempDir::new().unwrap();
        let source = MaildirSource::new(tmp.path().join("nope"), tmp.path().join("kb"));
        let err = source.fetch_new().await.unwrap_err();
        assert!(matches!(err, ChannelError::FetchFailed { .. }));
    }
}
