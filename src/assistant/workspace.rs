//! Per-session scratch directory for one agent run.
//!
//! The directory holds:
//! - The prompt: stdin.txt
//! - The inbound message: email.txt, email.html, copied attachments
//! - Whatever the agent writes (reply_email.*, reports, exports)
//!
//! Files present before the agent starts are "known"; everything else found
//! afterwards is a candidate attachment.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::fs;

use crate::assistant::plan::AttachmentRef;
use crate::channels::email_types::MessageMeta;
use crate::error::WorkspaceError;

/// Well-known file names inside a session directory.
pub mod names {
    pub const STDIN: &str = "stdin.txt";
    pub const EMAIL_TEXT: &str = "email.txt";
    pub const EMAIL_HTML: &str = "email.html";
    pub const REPLY_TEXT: &str = "reply.txt";
    pub const REPLY_MD: &str = "reply_email.md";
    pub const REPLY_HTML: &str = "reply_email.html";
}

/// Reply bodies written by convention; never treated as attachments.
pub const CONVENTIONAL_REPLY_FILES: &[&str] =
    &[names::REPLY_TEXT, names::REPLY_MD, names::REPLY_HTML];

/// A regular file at the top level of the session directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceArtifact {
    pub name: String,
    pub path: PathBuf,
    pub is_known: bool,
}

/// Scratch directory for a single invocation.
#[derive(Debug, Clone)]
pub struct SessionWorkspace {
    dir: PathBuf,
    prepared: Vec<String>,
    known: HashSet<String>,
}

impl SessionWorkspace {
    /// Create the directory and stage the prompt and message inputs.
    ///
    /// Only directory creation can fail; each staged file is best-effort and
    /// simply left out of the prepared list when it cannot be written.
    pub async fn prepare(
        dir: impl Into<PathBuf>,
        message: &MessageMeta,
        prompt: &str,
    ) -> Result<Self, WorkspaceError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| WorkspaceError::CreateDir {
                path: dir.clone(),
                source,
            })?;

        let mut ws = Self {
            dir,
            prepared: Vec::new(),
            known: HashSet::new(),
        };

        ws.stage(names::STDIN, prompt.as_bytes()).await;
        if !message.text.is_empty() {
            ws.stage(names::EMAIL_TEXT, message.text.as_bytes()).await;
        }
        if let Some(html) = message.html_body() {
            ws.stage(names::EMAIL_HTML, html.as_bytes()).await;
        }

        for attachment in &message.attachments {
            let Some(name) = basename(&attachment.filename)
                .or_else(|| basename(&attachment.path.to_string_lossy()))
            else {
                tracing::warn!(
                    path = %attachment.path.display(),
                    "Skipping attachment without a usable name"
                );
                continue;
            };
            let dest = ws.dir.join(&name);
            match fs::copy(&attachment.path, &dest).await {
                Ok(_) => ws.mark_prepared(name),
                Err(e) => tracing::warn!(
                    source = %attachment.path.display(),
                    dest = %dest.display(),
                    error = %e,
                    "Failed to copy attachment into work dir"
                ),
            }
        }

        tracing::debug!(
            dir = %ws.dir.display(),
            prepared = ?ws.prepared,
            "Work dir prepared"
        );
        Ok(ws)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a file inside the directory.
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Files staged by [`prepare`](Self::prepare), in staging order.
    pub fn prepared_names(&self) -> &[String] {
        &self.prepared
    }

    /// Whether `name` is excluded from attachment detection.
    pub fn is_known(&self, name: &str) -> bool {
        self.known.contains(name)
    }

    /// Mark every file currently in the directory as known.
    ///
    /// Called right before the agent starts so leftovers from a reused
    /// session id are not mistaken for output.
    pub async fn absorb_existing(&mut self) {
        match self.scan(&[]).await {
            Ok(artifacts) => {
                for artifact in artifacts {
                    self.known.insert(artifact.name);
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to list work dir before run"),
        }
    }

    /// Write a file into the directory. Written files become known.
    pub async fn write(&mut self, name: &str, contents: &str) -> Result<PathBuf, WorkspaceError> {
        let path = self.dir.join(name);
        fs::write(&path, contents)
            .await
            .map_err(|source| WorkspaceError::Io {
                path: path.clone(),
                source,
            })?;
        self.known.insert(name.to_string());
        Ok(path)
    }

    /// Read a file from the directory, `None` when absent or unreadable.
    pub async fn read_optional(&self, name: &str) -> Option<String> {
        let path = self.dir.join(name);
        match fs::read_to_string(&path).await {
            Ok(s) => Some(s),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read work dir file");
                None
            }
        }
    }

    /// List top-level regular files, sorted by name.
    ///
    /// `extra_known` is added to the known set for this listing only.
    pub async fn scan(
        &self,
        extra_known: &[&str],
    ) -> Result<Vec<WorkspaceArtifact>, WorkspaceError> {
        let io_err = |source| WorkspaceError::Io {
            path: self.dir.clone(),
            source,
        };
        let mut entries = fs::read_dir(&self.dir).await.map_err(io_err)?;
        let mut out = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();
            // Follows symlinks; a dangling link is skipped.
            let Ok(meta) = fs::metadata(&path).await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let is_known = self.known.contains(&name) || extra_known.contains(&name.as_str());
            out.push(WorkspaceArtifact {
                name,
                path,
                is_known,
            });
        }

        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Files the agent produced: everything not known, not conventional and
    /// not in `extra_known`.
    pub async fn generated_files(&self, extra_known: &[&str]) -> Vec<AttachmentRef> {
        let mut excluded: Vec<&str> = CONVENTIONAL_REPLY_FILES.to_vec();
        excluded.extend_from_slice(extra_known);

        match self.scan(&excluded).await {
            Ok(artifacts) => artifacts
                .into_iter()
                .filter(|a| !a.is_known)
                .map(|a| AttachmentRef {
                    path: a.path,
                    filename: Some(a.name),
                    content_type: None,
                })
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list work dir for generated files");
                Vec::new()
            }
        }
    }

    async fn stage(&mut self, name: &str, contents: &[u8]) {
        let path = self.dir.join(name);
        match fs::write(&path, contents).await {
            Ok(()) => self.mark_prepared(name.to_string()),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to stage work dir file")
            }
        }
    }

    fn mark_prepared(&mut self, name: String) {
        if self.known.insert(name.clone()) {
            self.prepared.push(name);
        }
    }
}

/// Final path component, if any.
fn basename(name: &str) -> Option<String> {
    Path::new(name.trim())
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
}
