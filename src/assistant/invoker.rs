//! Running the external agent CLI.
//!
//! The agent may keep running after printing its final JSON record, so
//! stdout is watched as it streams and the process is stopped once a final
//! record is visible.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdout, Command};

use crate::config::AnthropicSettings;
use crate::error::InvokeError;

/// Characters of stderr kept in a [`InvokeError::Process`].
const MAX_STDERR_CHARS: usize = 200;

/// Read chunk size for the output pipes (one full pipe buffer).
const READ_CHUNK: usize = 64 * 1024;

/// After completion is detected, stdout keeps being drained until it has
/// been quiet this long, so a record spread over several writes stays whole.
const DRAIN_QUIET: Duration = Duration::from_millis(50);

/// Ambient variables the agent needs to run at all.
pub const PASSTHROUGH_VARS: &[&str] = &[
    "PATH", "HOME", "USER", "LANG", "LC_ALL", "TMPDIR", "SHELL", "TERM",
];

static RESULT_TYPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""type"\s*:\s*"result""#).unwrap());
static RESULT_FIELD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#""result"\s*:"#).unwrap());

/// Decides from accumulated stdout whether the agent has finished.
pub trait CompletionDetector: Send + Sync {
    fn is_complete(&self, stdout: &str) -> bool;
}

/// Complete once a `"type": "result"` record or a `"result":` field shows up.
///
/// A tool echoing `"result":` early is a false positive; that is accepted.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultFieldDetector;

impl CompletionDetector for ResultFieldDetector {
    fn is_complete(&self, stdout: &str) -> bool {
        RESULT_TYPE.is_match(stdout) || RESULT_FIELD.is_match(stdout)
    }
}

/// Credentials and models handed to the agent, rendered into its environment.
#[derive(Debug, Clone)]
pub struct AgentEnv {
    base_url: String,
    auth_token: SecretString,
    small_fast_model: String,
    model: String,
}

impl AgentEnv {
    pub fn from_settings(settings: &AnthropicSettings) -> Self {
        Self {
            base_url: settings.base_url.clone().unwrap_or_default(),
            auth_token: settings
                .token
                .clone()
                .unwrap_or_else(|| SecretString::from(String::new())),
            small_fast_model: settings.small_model.clone().unwrap_or_default(),
            model: settings.model.clone().unwrap_or_default(),
        }
    }

    /// The full environment for the child: allowlisted ambient variables
    /// from `ambient`, then the ANTHROPIC_* set (empty when unset).
    pub fn render(&self, ambient: impl Fn(&str) -> Option<String>) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = PASSTHROUGH_VARS
            .iter()
            .filter_map(|key| ambient(key).map(|v| (key.to_string(), v)))
            .collect();

        let token = self.auth_token.expose_secret().to_string();
        env.insert("ANTHROPIC_BASE_URL".into(), self.base_url.clone());
        env.insert("ANTHROPIC_AUTH_TOKEN".into(), token.clone());
        env.insert("ANTHROPIC_API_KEY".into(), token);
        env.insert(
            "ANTHROPIC_SMALL_FAST_MODEL".into(),
            self.small_fast_model.clone(),
        );
        env.insert("ANTHROPIC_MODEL".into(), self.model.clone());
        env
    }

    /// Which values are set, for logging.
    pub fn presence(&self) -> [(&'static str, bool); 4] {
        [
            ("base_url", !self.base_url.is_empty()),
            ("token", !self.auth_token.expose_secret().is_empty()),
            ("small_fast_model", !self.small_fast_model.is_empty()),
            ("model", !self.model.is_empty()),
        ]
    }
}

/// Fixed CLI arguments, plus `--model` when one is configured.
pub fn build_args(model: Option<&str>) -> Vec<String> {
    let mut args: Vec<String> = [
        "--output-format",
        "json",
        "--allowedTools",
        "Bash,Read",
        "--permission-mode",
        "acceptEdits",
        "--dangerously-skip-permissions",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    if let Some(model) = model.map(str::trim).filter(|m| !m.is_empty()) {
        args.push("--model".into());
        args.push(model.to_string());
    }
    args
}

/// One agent run, fully described.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub session_id: String,
    pub work_dir: PathBuf,
    pub prompt: String,
    pub env: BTreeMap<String, String>,
    pub binary: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl InvocationRequest {
    /// Same request against another binary.
    pub fn with_binary(&self, binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            ..self.clone()
        }
    }
}

/// Spawn the agent, feed it the prompt and collect stdout until completion.
///
/// Returns the stdout collected up to the point completion was detected, or
/// everything it printed when it exited 0 without a detectable result.
pub async fn run_agent(
    request: &InvocationRequest,
    detector: &dyn CompletionDetector,
) -> Result<String, InvokeError> {
    let mut command = Command::new(&request.binary);
    command
        .args(&request.args)
        .current_dir(&request.work_dir)
        .env_clear()
        .envs(&request.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|source| InvokeError::Spawn {
        binary: request.binary.clone(),
        source,
    })?;

    tracing::info!(
        session = %request.session_id,
        binary = %request.binary,
        pid = ?child.id(),
        "Agent started"
    );

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| std::io::Error::other("missing stdin pipe"))?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("missing stdout pipe"))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("missing stderr pipe"))?;

    // Writing in the background keeps a large prompt from blocking the reads.
    let prompt = request.prompt.clone();
    let writer = tokio::spawn(async move {
        if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
            tracing::debug!(error = %e, "Agent closed stdin early");
        }
        // Dropping stdin closes the pipe.
    });

    let started = Instant::now();
    let mut out: Vec<u8> = Vec::new();
    let mut err: Vec<u8> = Vec::new();
    let mut out_chunk = vec![0u8; READ_CHUNK];
    let mut err_chunk = vec![0u8; READ_CHUNK];
    let mut stdout_open = true;
    let mut stderr_open = true;
    let mut exit_status: Option<ExitStatus> = None;

    let deadline_at = tokio::time::Instant::now() + request.timeout;
    let deadline = tokio::time::sleep_until(deadline_at);
    tokio::pin!(deadline);

    while exit_status.is_none() || stdout_open || stderr_open {
        tokio::select! {
            read = stdout.read(&mut out_chunk), if stdout_open => match read {
                Ok(0) => stdout_open = false,
                Ok(n) => {
                    out.extend_from_slice(&out_chunk[..n]);
                    if detector.is_complete(&String::from_utf8_lossy(&out)) {
                        let _ = tokio::time::timeout_at(
                            deadline_at,
                            drain_stdout(&mut stdout, &mut out, &mut out_chunk),
                        )
                        .await;
                        if exit_status.is_none() {
                            let _ = child.start_kill();
                        }
                        writer.abort();
                        tracing::info!(
                            session = %request.session_id,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            stdout_len = out.len(),
                            "Agent result detected, stopping process"
                        );
                        return Ok(String::from_utf8_lossy(&out).into_owned());
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Agent stdout read failed");
                    stdout_open = false;
                }
            },
            read = stderr.read(&mut err_chunk), if stderr_open => match read {
                Ok(0) => stderr_open = false,
                Ok(n) => err.extend_from_slice(&err_chunk[..n]),
                Err(e) => {
                    tracing::warn!(error = %e, "Agent stderr read failed");
                    stderr_open = false;
                }
            },
            status = child.wait(), if exit_status.is_none() => {
                exit_status = Some(status?);
            },
            () = &mut deadline => {
                if exit_status.is_none() {
                    let _ = child.start_kill();
                }
                writer.abort();
                tracing::warn!(
                    session = %request.session_id,
                    timeout_ms = request.timeout.as_millis() as u64,
                    stdout_len = out.len(),
                    stderr_len = err.len(),
                    "Agent timed out, process killed"
                );
                return Err(InvokeError::Timeout {
                    timeout: request.timeout,
                    stdout_len: out.len(),
                    stderr_len: err.len(),
                });
            },
        }
    }

    writer.abort();
    let status = exit_status.ok_or_else(|| std::io::Error::other("agent exit status lost"))?;
    let stdout_text = String::from_utf8_lossy(&out).into_owned();

    tracing::info!(
        session = %request.session_id,
        code = ?status.code(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        stdout_len = out.len(),
        stderr_len = err.len(),
        "Agent exited"
    );

    if status.success() || detector.is_complete(&stdout_text) {
        return Ok(stdout_text);
    }

    Err(InvokeError::Process {
        code: status.code().unwrap_or(-1),
        stderr: String::from_utf8_lossy(&err)
            .chars()
            .take(MAX_STDERR_CHARS)
            .collect(),
    })
}

/// Append whatever the agent keeps writing until stdout closes or goes quiet.
async fn drain_stdout(stdout: &mut ChildStdout, out: &mut Vec<u8>, chunk: &mut [u8]) {
    while let Ok(Ok(n)) = tokio::time::timeout(DRAIN_QUIET, stdout.read(chunk)).await {
        if n == 0 {
            break;
        }
        out.extend_from_slice(&chunk[..n]);
    }
}

/// [`run_agent`], retried once with `fallback` when the binary cannot be spawned.
pub async fn run_with_fallback(
    request: &InvocationRequest,
    fallback: &str,
    detector: &dyn CompletionDetector,
) -> Result<String, InvokeError> {
    match run_agent(request, detector).await {
        Err(InvokeError::Spawn { binary, source })
            if !fallback.is_empty() && fallback != request.binary =>
        {
            tracing::warn!(
                binary = %binary,
                fallback = %fallback,
                error = %source,
                "Agent binary failed to spawn, trying fallback"
            );
            run_agent(&request.with_binary(fallback), detector).await
        }
        other => other,
    }
}
