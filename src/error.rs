//! Error types for mail-assist.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variables: {}", .0.join(", "))]
    MissingEnvVars(Vec<String>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Agent invocation failures surfaced to the caller.
///
/// Everything else in the pipeline degrades to a best-effort reply.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("Failed to spawn agent binary {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "Agent timed out after {timeout:?} (stdout {stdout_len} bytes, stderr {stderr_len} bytes)"
    )]
    Timeout {
        timeout: Duration,
        stdout_len: usize,
        stderr_len: usize,
    },

    #[error("Agent exited with code {code}: {stderr}")]
    Process { code: i32, stderr: String },

    #[error("Agent pipe error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),
}

impl InvokeError {
    /// Short machine-friendly name of the failure kind, for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Spawn { .. } => "spawn",
            Self::Timeout { .. } => "timeout",
            Self::Process { .. } => "process",
            Self::Io(_) => "io",
            Self::Workspace(_) => "workspace",
        }
    }
}

/// Per-session scratch directory errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("Failed to create work directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Agent stdout was not the JSON we expected. Always recovered locally.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Agent output is empty")]
    Empty,

    #[error("Agent output is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// A structured reply plan could not be honored. Always recovered locally.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("Reply file {path} is unreadable: {source}")]
    UnreadableReplyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Mail channel errors (source and delivery).
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to fetch: {reason}")]
    FetchFailed { name: String, reason: String },

    #[error("Failed to send reply on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),
}
