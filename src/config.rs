//! Configuration types, built from environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Agent binary used when `CLAUDE_BIN` is unset.
pub const DEFAULT_AGENT_BIN: &str = "claude";

/// Per-invocation budget for the agent process.
pub const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(180);

/// Default mailbox poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Marker that addresses a message to the assistant.
pub const DEFAULT_TRIGGER: &str = "@assistant";

/// Variables that must be present for a live (non dry-run) start.
const REQUIRED_VARS: &[&str] = &[
    "MAIL_USER",
    "MAIL_PASS",
    "ANTHROPIC_BASE_URL",
    "ANTHROPIC_AUTH_TOKEN",
    "ANTHROPIC_SMALL_FAST_MODEL",
    "ANTHROPIC_MODEL",
];

/// Credentials and model selection forwarded to the agent process.
#[derive(Debug, Clone, Default)]
pub struct AnthropicSettings {
    pub base_url: Option<String>,
    pub token: Option<SecretString>,
    pub small_model: Option<String>,
    pub model: Option<String>,
}

/// Agent invocation configuration.
#[derive(Debug, Clone)]
pub struct AssistantConfig {
    /// Primary agent binary (may start with `~/`).
    pub agent_bin: String,
    /// Binary name tried once when the primary cannot be spawned.
    pub fallback_bin: String,
    /// Root under which each session gets its own work directory.
    pub work_root: PathBuf,
    /// Hard budget for one agent run.
    pub timeout: Duration,
    pub anthropic: AnthropicSettings,
}

impl AssistantConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let timeout = var("ASSISTANT_TIMEOUT_MS")
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_INVOKE_TIMEOUT);

        Self {
            agent_bin: var("CLAUDE_BIN").unwrap_or_else(|| DEFAULT_AGENT_BIN.to_string()),
            fallback_bin: var("CLAUDE_FALLBACK_BIN")
                .unwrap_or_else(|| DEFAULT_AGENT_BIN.to_string()),
            work_root: var("ASSISTANT_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/assistant")),
            timeout,
            anthropic: AnthropicSettings {
                base_url: var("ANTHROPIC_BASE_URL"),
                token: var("ANTHROPIC_AUTH_TOKEN").map(SecretString::from),
                small_model: var("ANTHROPIC_SMALL_FAST_MODEL"),
                model: var("ANTHROPIC_MODEL"),
            },
        }
    }

    /// Primary binary with a leading `~/` expanded against `$HOME`.
    pub fn resolved_agent_bin(&self) -> String {
        expand_home(&self.agent_bin)
    }
}

/// Mailbox and delivery configuration.
#[derive(Debug, Clone)]
pub struct MailConfig {
    /// Maildir spool (`new/`, `cur/`, `tmp/`) that inbound mail lands in.
    pub maildir: PathBuf,
    /// Archive of parsed messages and their attachments.
    pub kb_dir: PathBuf,
    pub poll_interval: Duration,
    pub trigger: String,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl MailConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let poll_interval = var("POLL_INTERVAL_MS")
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_POLL_INTERVAL);

        let smtp_port: u16 = var("SMTP_PORT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(465);

        let username = var("MAIL_USER").unwrap_or_default();
        let from_address = var("MAIL_FROM").unwrap_or_else(|| username.clone());

        Self {
            maildir: var("MAILDIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/maildir")),
            kb_dir: var("KB_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/kb")),
            poll_interval,
            trigger: var("ASSISTANT_TRIGGER").unwrap_or_else(|| DEFAULT_TRIGGER.to_string()),
            smtp_host: var("SMTP_HOST").unwrap_or_else(|| "smtp.163.com".to_string()),
            smtp_port,
            username,
            password: SecretString::from(var("MAIL_PASS").unwrap_or_default()),
            from_address,
        }
    }
}

/// Everything the daemon needs.
#[derive(Debug, Clone)]
pub struct Settings {
    pub assistant: AssistantConfig,
    pub mail: MailConfig,
    /// `DRY_RUN=1`: validate config and exit without touching the network or agent.
    pub dry_run: bool,
    missing: Vec<String>,
}

impl Settings {
    /// Build settings from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let missing = REQUIRED_VARS
            .iter()
            .filter(|key| lookup(**key).is_none_or(|v| v.is_empty()))
            .map(|key| key.to_string())
            .collect();

        Self {
            assistant: AssistantConfig::from_lookup(&lookup),
            mail: MailConfig::from_lookup(&lookup),
            dry_run: lookup("DRY_RUN").as_deref() == Some("1"),
            missing,
        }
    }

    /// Required variables that were absent or empty.
    pub fn missing_vars(&self) -> &[String] {
        &self.missing
    }

    /// Fail with the list of missing variables, if any.
    pub fn require_complete(&self) -> Result<(), ConfigError> {
        if self.missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::MissingEnvVars(self.missing.clone()))
        }
    }

    /// Create the work root, archive and maildir layout.
    pub fn ensure_dirs(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.assistant.work_root)?;
        std::fs::create_dir_all(&self.mail.kb_dir)?;
        for sub in ["new", "cur", "tmp"] {
            std::fs::create_dir_all(self.mail.maildir.join(sub))?;
        }
        Ok(())
    }
}

/// Expand a leading `~/` against `$HOME`.
pub fn expand_home(path: &str) -> String {
    if path.is_empty() {
        return DEFAULT_AGENT_BIN.to_string();
    }
    match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => Path::new(&home).join(rest).to_string_lossy().into_owned(),
        _ => path.to_string(),
    }
}
