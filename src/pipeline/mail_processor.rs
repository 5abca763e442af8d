//! Background mail processor: polls the source, runs the assistant on
//! triggered messages and sends the replies.
//!
//! Timer-based loop:
//! 1. `MailSource::fetch_new()`
//! 2. Skip self-sent and untriggered messages
//! 3. `Assistant::invoke()` → `ResolvedReply`
//! 4. `ReplySender::send_reply()` unless the answer is NO_REPLY

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::assistant::Assistant;
use crate::channels::email_types::MessageMeta;
use crate::config::MailConfig;
use crate::pipeline::types::{CycleReport, MailSource, ReplySender};

/// Spawn a background task that runs [`process_once`] every poll interval.
///
/// The first cycle runs immediately. Returns a `JoinHandle` and shutdown flag;
/// the flag is checked before each cycle.
pub fn spawn_mail_processor(
    source: Arc<dyn MailSource>,
    sender: Arc<dyn ReplySender>,
    assistant: Arc<Assistant>,
    config: MailConfig,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(
            source = source.name(),
            sender = sender.name(),
            interval_ms = config.poll_interval.as_millis() as u64,
            trigger = %config.trigger,
            "Mail processor started"
        );

        let mut tick = tokio::time::interval(config.poll_interval);
        // Slow cycles push the next poll back instead of bursting.
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Mail processor shutting down");
                return;
            }

            let report = process_once(source.as_ref(), sender.as_ref(), &assistant, &config).await;
            if report.is_idle() {
                debug!("No new mail");
            } else {
                info!(
                    fetched = report.fetched,
                    triggered = report.triggered,
                    replied = report.replied,
                    skipped = report.skipped,
                    failed = report.failed,
                    "Mail cycle complete"
                );
            }
        }
    });

    (handle, shutdown_flag)
}

/// Run one fetch → assist → reply cycle. Failures are per message.
pub async fn process_once(
    source: &dyn MailSource,
    sender: &dyn ReplySender,
    assistant: &Assistant,
    config: &MailConfig,
) -> CycleReport {
    let mut report = CycleReport::default();

    let messages = match source.fetch_new().await {
        Ok(msgs) => msgs,
        Err(e) => {
            error!(source = source.name(), error = %e, "Failed to fetch new mail");
            return report;
        }
    };
    report.fetched = messages.len();

    for message in &messages {
        if is_self_sent(message, config) {
            debug!(id = %message.id, from = %message.from, "Skipping our own message");
            report.skipped += 1;
            continue;
        }

        let triggered = message.mentions(&config.trigger);
        info!(
            id = %message.id,
            from = %message.from,
            subject = %message.subject,
            triggered,
            "Inbound message"
        );
        if !triggered {
            report.skipped += 1;
            continue;
        }
        report.triggered += 1;

        let reply = match assistant.invoke(message, None).await {
            Ok(reply) => reply,
            Err(e) => {
                error!(id = %message.id, kind = e.kind(), error = %e, "Assistant failed");
                report.failed += 1;
                continue;
            }
        };

        if reply.is_no_reply() {
            info!(id = %message.id, "Assistant chose not to reply");
            report.skipped += 1;
            continue;
        }

        match sender.send_reply(message, &reply).await {
            Ok(()) => {
                info!(
                    id = %message.id,
                    to = %message.from,
                    attachments = reply.attachments.len(),
                    "Reply delivered"
                );
                report.replied += 1;
            }
            Err(e) => {
                warn!(id = %message.id, error = %e, "Failed to deliver reply");
                report.failed += 1;
            }
        }
    }

    report
}

/// Mail from our own address (our replies looping back) is never answered.
fn is_self_sent(message: &MessageMeta, config: &MailConfig) -> bool {
    let from = message.from.trim();
    !from.is_empty()
        && [&config.from_address, &config.username]
            .iter()
            .any(|own| !own.is_empty() && own.eq_ignore_ascii_case(from))
}
