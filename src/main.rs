use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};

use mail_assist::assistant::Assistant;
use mail_assist::channels::{MaildirSource, MessageMeta, SmtpSender};
use mail_assist::config::Settings;
use mail_assist::pipeline::{MailSource, ReplySender, spawn_mail_processor};

const USAGE: &str = "usage: mail-assist [ask <text>...]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    // Initialize tracing; stdout is reserved for command output
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let settings = Settings::from_env();
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.first().map(String::as_str) {
        None => run_daemon(settings).await,
        Some("ask") => run_ask(settings, &args[1..].join(" ")).await,
        Some("-h" | "--help" | "help") => {
            eprintln!("{USAGE}");
            Ok(())
        }
        Some(other) => anyhow::bail!("unknown command {other:?}\n{USAGE}"),
    }
}

/// Poll the mailbox until Ctrl-C or SIGTERM.
async fn run_daemon(settings: Settings) -> anyhow::Result<()> {
    if !settings.missing_vars().is_empty() {
        error!(missing = ?settings.missing_vars(), "Required environment variables missing");
        if !settings.dry_run {
            settings.require_complete()?;
        }
    }

    settings
        .ensure_dirs()
        .context("Failed to create data directories")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        maildir = %settings.mail.maildir.display(),
        poll_interval_ms = settings.mail.poll_interval.as_millis() as u64,
        trigger = %settings.mail.trigger,
        dry_run = settings.dry_run,
        "Starting mail assistant"
    );

    if settings.dry_run {
        info!("Dry run: skipping mailbox polling and agent calls");
        return Ok(());
    }

    let assistant = Arc::new(Assistant::new(settings.assistant.clone()));
    let source: Arc<dyn MailSource> = Arc::new(MaildirSource::new(
        &settings.mail.maildir,
        &settings.mail.kb_dir,
    ));
    let sender: Arc<dyn ReplySender> = Arc::new(SmtpSender::new(settings.mail.clone()));

    let (handle, shutdown) = spawn_mail_processor(source, sender, assistant, settings.mail.clone());

    shutdown_signal().await;
    shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
    handle.abort();
    info!("Mail assistant stopped");
    Ok(())
}

/// Run the assistant once on `text` and print the resolved reply as JSON.
async fn run_ask(settings: Settings, text: &str) -> anyhow::Result<()> {
    if text.trim().is_empty() {
        anyhow::bail!("{USAGE}");
    }
    std::fs::create_dir_all(&settings.assistant.work_root)
        .with_context(|| format!("Failed to create {}", settings.assistant.work_root.display()))?;

    let from = if settings.mail.from_address.is_empty() {
        "manual@localhost".to_string()
    } else {
        settings.mail.from_address.clone()
    };
    let message = MessageMeta::new(from, "Manual request", text);

    let reply = Assistant::new(settings.assistant)
        .invoke(&message, None)
        .await
        .context("Assistant run failed")?;

    println!("{}", serde_json::to_string_pretty(&reply)?);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl-C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}
