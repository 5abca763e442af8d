//! End-to-end tests: a fake agent CLI (a shell script) driven through the
//! assistant and the mail processor.
#![cfg(unix)]

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::TempDir;

use mail_assist::assistant::{Assistant, ResolvedReply};
use mail_assist::channels::{MaildirSource, MessageMeta};
use mail_assist::config::{AssistantConfig, MailConfig};
use mail_assist::error::{ChannelError, InvokeError};
use mail_assist::pipeline::{ReplySender, process_once};

// Writing and exec'ing scripts from parallel threads can hit ETXTBSY.
static SERIAL: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

fn fake_agent(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-claude");
    std::fs::write(&path, format!("#!/bin/sh\ncat > /dev/null\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn config(tmp: &TempDir, agent: &Path, extra: &[(&str, &str)]) -> AssistantConfig {
    let mut vars: HashMap<String, String> = HashMap::from([
        ("CLAUDE_BIN".to_string(), agent.display().to_string()),
        (
            "ASSISTANT_WORK_DIR".to_string(),
            tmp.path().join("work").display().to_string(),
        ),
        ("ASSISTANT_TIMEOUT_MS".to_string(), "20000".to_string()),
    ]);
    for (k, v) in extra {
        vars.insert(k.to_string(), v.to_string());
    }
    AssistantConfig::from_lookup(move |key: &str| vars.get(key).cloned())
}

fn message() -> MessageMeta {
    MessageMeta::new("alice@example.com", "Q3 @assistant", "Please send the Q3 summary.")
}

fn names(reply: &ResolvedReply) -> Vec<String> {
    reply.attachments.iter().map(|a| a.display_name()).collect()
}

#[tokio::test]
async fn structured_markdown_reply_with_generated_attachment() {
    let _guard = SERIAL.lock().await;
    let tmp = TempDir::new().unwrap();
    let agent = fake_agent(
        tmp.path(),
        r##"printf 'Hello **world**' > reply_email.md
printf 'a,b\n' > report.csv
printf '{"type":"result","result":"{\\"reply\\":\\"REPLY\\",\\"reply_file\\":\\"%s/reply_email.md\\",\\"format\\":\\"md\\",\\"attachments\\":[]}"}\n' "$PWD""##,
    );
    let assistant = Assistant::new(config(&tmp, &agent, &[]));

    let reply = assistant.invoke(&message(), None).await.unwrap();

    assert_eq!(reply.text, "Hello **world**");
    assert!(reply.html.as_deref().unwrap().contains("<strong>world</strong>"));
    assert_eq!(names(&reply), vec!["report.csv"]);
}

#[tokio::test]
async fn no_reply_sentinel() {
    let _guard = SERIAL.lock().await;
    let tmp = TempDir::new().unwrap();
    let agent = fake_agent(
        tmp.path(),
        r#"printf 'scratch' > notes.txt
printf '{"type":"result","result":"  NO_REPLY\\n"}'"#,
    );
    let assistant = Assistant::new(config(&tmp, &agent, &[]));

    let reply = assistant.invoke(&message(), None).await.unwrap();

    assert!(reply.is_no_reply());
    assert!(reply.html.is_none());
    assert!(reply.attachments.is_empty());
}

#[tokio::test]
async fn raw_answer_attaches_new_files_only() {
    let _guard = SERIAL.lock().await;
    let tmp = TempDir::new().unwrap();
    let agent = fake_agent(
        tmp.path(),
        r#"printf 'numbers' > report.txt
printf '[{"type":"system","subtype":"init"},{"type":"result","result":"done"}]'"#,
    );
    let assistant = Assistant::new(config(&tmp, &agent, &[]));

    let reply = assistant.invoke(&message(), Some("raw-case")).await.unwrap();

    assert_eq!(reply.text, "done");
    assert_eq!(names(&reply), vec!["report.txt"]);
    let work_dir = tmp.path().join("work").join("raw-case");
    assert!(work_dir.join("stdin.txt").is_file());
    assert!(work_dir.join("email.txt").is_file());
    assert_eq!(
        std::fs::read_to_string(work_dir.join("reply.txt")).unwrap(),
        "done"
    );
}

#[tokio::test]
async fn agent_receives_args_and_explicit_env() {
    let _guard = SERIAL.lock().await;
    let tmp = TempDir::new().unwrap();
    let agent = fake_agent(
        tmp.path(),
        r#"printf '{"result":"%s|model=%s|key=%s|leak=%s"}' "$*" "$ANTHROPIC_MODEL" "$ANTHROPIC_API_KEY" "${CARGO_PKG_NAME:-none}""#,
    );
    let assistant = Assistant::new(config(
        &tmp,
        &agent,
        &[("ANTHROPIC_MODEL", "m-test"), ("ANTHROPIC_AUTH_TOKEN", "tok")],
    ));

    let reply = assistant.invoke(&message(), None).await.unwrap();

    assert!(reply.text.starts_with(
        "--output-format json --allowedTools Bash,Read --permission-mode acceptEdits \
         --dangerously-skip-permissions --model m-test|"
    ));
    assert!(reply.text.contains("|model=m-test|"));
    assert!(reply.text.contains("|key=tok|"));
    assert!(reply.text.ends_with("|leak=none"));
}

#[tokio::test]
async fn early_completion_does_not_wait_for_exit() {
    let _guard = SERIAL.lock().await;
    let tmp = TempDir::new().unwrap();
    let agent = fake_agent(
        tmp.path(),
        r#"printf '{"type":"result","result":"quick"}'
sleep 30
exit 1"#,
    );
    let assistant = Assistant::new(config(&tmp, &agent, &[]));

    let started = Instant::now();
    let reply = assistant.invoke(&message(), None).await.unwrap();

    assert_eq!(reply.text, "quick");
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn timeout_is_surfaced() {
    let _guard = SERIAL.lock().await;
    let tmp = TempDir::new().unwrap();
    let agent = fake_agent(tmp.path(), "sleep 30");
    let assistant = Assistant::new(config(&tmp, &agent, &[("ASSISTANT_TIMEOUT_MS", "300")]));

    let err = assistant.invoke(&message(), None).await.unwrap_err();
    assert!(matches!(err, InvokeError::Timeout { .. }));
}

#[tokio::test]
async fn fallback_binary_used_when_primary_missing() {
    let _guard = SERIAL.lock().await;
    let tmp = TempDir::new().unwrap();
    let agent = fake_agent(tmp.path(), r#"printf '{"result":"from fallback"}'"#);
    let mut cfg = config(&tmp, &agent, &[]);
    cfg.agent_bin = tmp.path().join("missing-claude").display().to_string();
    cfg.fallback_bin = agent.display().to_string();

    let reply = Assistant::new(cfg).invoke(&message(), None).await.unwrap();
    assert_eq!(reply.text, "from fallback");
}

#[tokio::test]
async fn failing_agent_is_process_error() {
    let _guard = SERIAL.lock().await;
    let tmp = TempDir::new().unwrap();
    let agent = fake_agent(tmp.path(), "echo 'auth failed' >&2\nexit 3");
    let assistant = Assistant::new(config(&tmp, &agent, &[]));

    match assistant.invoke(&message(), None).await {
        Err(InvokeError::Process { code, stderr }) => {
            assert_eq!(code, 3);
            assert!(stderr.contains("auth failed"));
        }
        other => panic!("expected process error, got {other:?}"),
    }
}

#[derive(Default)]
struct RecordingSender {
    sent: StdMutex<Vec<(String, ResolvedReply)>>,
}

#[async_trait]
impl ReplySender for RecordingSender {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send_reply(
        &self,
        original: &MessageMeta,
        reply: &ResolvedReply,
    ) -> Result<(), ChannelError> {
        self.sent
            .lock()
            .unwrap()
            .push((original.from.clone(), reply.clone()));
        Ok(())
    }
}

#[tokio::test]
async fn maildir_to_reply_cycle() {
    let _guard = SERIAL.lock().await;
    let tmp = TempDir::new().unwrap();
    let agent = fake_agent(
        tmp.path(),
        r#"test -f email.txt || exit 9
printf '{"type":"result","result":"On it."}'"#,
    );
    let assistant = Assistant::new(config(&tmp, &agent, &[]));

    let maildir = tmp.path().join("Maildir");
    for sub in ["new", "cur", "tmp"] {
        std::fs::create_dir_all(maildir.join(sub)).unwrap();
    }
    std::fs::write(
        maildir.join("new").join("1.a.host"),
        "From: carol@example.com\r\nSubject: help @assistant\r\nMessage-ID: <c1@example.com>\r\n\r\nCan you check this?\r\n",
    )
    .unwrap();
    std::fs::write(
        maildir.join("new").join("2.b.host"),
        "From: dave@example.com\r\nSubject: lunch\r\n\r\nNo trigger here.\r\n",
    )
    .unwrap();

    let mail_vars: HashMap<&str, &str> = HashMap::from([("MAIL_USER", "bot@example.com")]);
    let mail_config =
        MailConfig::from_lookup(move |key: &str| mail_vars.get(key).map(|v| v.to_string()));
    let source = MaildirSource::new(&maildir, tmp.path().join("kb"));
    let sender = RecordingSender::default();

    let report = process_once(&source, &sender, &assistant, &mail_config).await;

    assert_eq!(report.fetched, 2);
    assert_eq!(report.triggered, 1);
    assert_eq!(report.replied, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.failed, 0);

    let sent = sender.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "carol@example.com");
    assert_eq!(sent[0].1.text, "On it.");
}
