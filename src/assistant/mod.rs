//! The assistant core: one agent run per message.
//!
//! ```text
//! prompt ─► SessionWorkspace::prepare ─► run_agent ─► extract_answer
//!                                                        │
//!                      ResolvedReply ◄─ resolve ◄─ parse_plan
//! ```

pub mod invoker;
pub mod markdown;
pub mod plan;
pub mod prompt;
pub mod resolver;
pub mod workspace;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

pub use invoker::{CompletionDetector, InvocationRequest, ResultFieldDetector};
pub use plan::{AttachmentRef, NO_REPLY, ReplyFormat, ReplyPlan};
pub use resolver::ResolvedReply;
pub use workspace::SessionWorkspace;

use crate::channels::email_types::MessageMeta;
use crate::config::AssistantConfig;
use crate::error::InvokeError;

use invoker::{AgentEnv, build_args, run_with_fallback};

const SESSION_SUFFIX_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Runs the agent against inbound messages.
#[derive(Clone)]
pub struct Assistant {
    config: AssistantConfig,
    detector: Arc<dyn CompletionDetector>,
}

impl Assistant {
    pub fn new(config: AssistantConfig) -> Self {
        Self {
            config,
            detector: Arc::new(ResultFieldDetector),
        }
    }

    /// Replace the completion heuristic.
    pub fn with_detector(mut self, detector: impl CompletionDetector + 'static) -> Self {
        self.detector = Arc::new(detector);
        self
    }

    pub fn config(&self) -> &AssistantConfig {
        &self.config
    }

    /// Run the agent for `message` and resolve its reply.
    ///
    /// A [`ResolvedReply`] whose text is `NO_REPLY` means "send nothing".
    /// Errors are limited to workspace creation and the agent process itself;
    /// anything the agent says is turned into some reply.
    pub async fn invoke(
        &self,
        message: &MessageMeta,
        session_id: Option<&str>,
    ) -> Result<ResolvedReply, InvokeError> {
        let session_id = session_id
            .map(sanitize_session_id)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(new_session_id);
        let work_dir = absolute(self.config.work_root.join(&session_id));

        tracing::info!(
            session = %session_id,
            from = %message.from,
            subject = %message.subject,
            work_dir = %work_dir.display(),
            "Assistant session started"
        );

        let prompt = prompt::build_prompt(message, &work_dir);
        let mut workspace = SessionWorkspace::prepare(&work_dir, message, &prompt).await?;
        workspace.absorb_existing().await;

        let agent_env = AgentEnv::from_settings(&self.config.anthropic);
        let request = InvocationRequest {
            session_id: session_id.clone(),
            work_dir,
            prompt,
            env: agent_env.render(|key| std::env::var(key).ok()),
            binary: self.config.resolved_agent_bin(),
            args: build_args(self.config.anthropic.model.as_deref()),
            timeout: self.config.timeout,
        };

        tracing::info!(
            session = %session_id,
            binary = %request.binary,
            args = ?request.args,
            env = ?agent_env.presence(),
            "Invoking agent"
        );

        let stdout =
            run_with_fallback(&request, &self.config.fallback_bin, self.detector.as_ref()).await?;
        let answer = plan::extract_answer(&stdout);
        let plan = plan::parse_plan(&answer);
        let reply = resolver::resolve(plan, &answer, &mut workspace).await;

        tracing::info!(
            session = %session_id,
            no_reply = reply.is_no_reply(),
            has_html = reply.html.is_some(),
            attachments = reply.attachments.len(),
            "Assistant session finished"
        );
        Ok(reply)
    }
}

impl std::fmt::Debug for Assistant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Assistant")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// `<unix-millis>-<6 lowercase alphanumerics>`.
pub fn new_session_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let mut rng = rand::thread_rng();
    let suffix: String = (0..6)
        .map(|_| SESSION_SUFFIX_CHARSET[rng.gen_range(0..SESSION_SUFFIX_CHARSET.len())] as char)
        .collect();
    format!("{millis}-{suffix}")
}

/// Keep `[A-Za-z0-9._-]`, replace the rest with `_`. Pure-dot ids are rejected.
pub fn sanitize_session_id(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.chars().all(|c| c == '.') {
        String::new()
    } else {
        cleaned
    }
}

fn absolute(path: PathBuf) -> PathBuf {
    std::path::absolute(&path).unwrap_or(path)
}
