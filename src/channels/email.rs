//! Email delivery: SMTP via lettre for outbound replies.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;

use crate::assistant::ResolvedReply;
use crate::channels::email_types::{MessageMeta, reply_subject};
use crate::config::MailConfig;
use crate::error::ChannelError;
use crate::pipeline::types::ReplySender;

/// Port that speaks TLS from the first byte; anything else upgrades with STARTTLS.
const IMPLICIT_TLS_PORT: u16 = 465;

const OCTET_STREAM: &str = "application/octet-stream";

/// Sends assistant replies over SMTP.
#[derive(Debug, Clone)]
pub struct SmtpSender {
    config: MailConfig,
}

impl SmtpSender {
    pub fn new(config: MailConfig) -> Self {
        Self { config }
    }

    fn transport(&self) -> Result<SmtpTransport, ChannelError> {
        let creds = Credentials::new(
            self.config.username.clone(),
            self.config.password.expose_secret().to_string(),
        );

        let builder = if self.config.smtp_port == IMPLICIT_TLS_PORT {
            SmtpTransport::relay(&self.config.smtp_host)
        } else {
            SmtpTransport::starttls_relay(&self.config.smtp_host)
        }
        .map_err(|e| send_failed(format!("SMTP relay error: {e}")))?;

        Ok(builder
            .port(self.config.smtp_port)
            .credentials(creds)
            .build())
    }
}

#[async_trait]
impl ReplySender for SmtpSender {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send_reply(
        &self,
        original: &MessageMeta,
        reply: &ResolvedReply,
    ) -> Result<(), ChannelError> {
        let this = self.clone();
        let original = original.clone();
        let reply = reply.clone();

        // Attachment reads and the SMTP session are both blocking.
        tokio::task::spawn_blocking(move || {
            let email = build_reply(&this.config.from_address, &original, &reply)?;
            this.transport()?
                .send(&email)
                .map_err(|e| send_failed(format!("SMTP send failed: {e}")))?;
            tracing::info!(
                to = %original.from,
                subject = %original.subject,
                attachments = reply.attachments.len(),
                "Reply sent"
            );
            Ok(())
        })
        .await
        .map_err(|e| send_failed(format!("SMTP task panicked: {e}")))?
    }
}

/// Build the reply message: threaded headers, text or text+HTML body,
/// attachments read from disk.
pub fn build_reply(
    from_address: &str,
    original: &MessageMeta,
    reply: &ResolvedReply,
) -> Result<Message, ChannelError> {
    let from: Mailbox = from_address
        .parse()
        .map_err(|e| send_failed(format!("Invalid from address: {e}")))?;
    let to: Mailbox = original
        .from
        .parse()
        .map_err(|e| send_failed(format!("Invalid to address: {e}")))?;

    let mut builder = Message::builder()
        .from(from)
        .to(to)
        .subject(reply_subject(&original.subject));

    if !original.message_id.is_empty() {
        builder = builder.in_reply_to(angle(&original.message_id));
    }
    let references: Vec<String> = original
        .references
        .iter()
        .chain(std::iter::once(&original.message_id))
        .filter(|id| !id.is_empty())
        .map(|id| angle(id))
        .collect();
    if !references.is_empty() {
        builder = builder.references(references.join(" "));
    }

    let plain = if reply.text.is_empty() {
        reply.html.as_deref().map(strip_html).unwrap_or_default()
    } else {
        reply.text.clone()
    };

    let email = if reply.attachments.is_empty() {
        match &reply.html {
            Some(html) => builder.multipart(MultiPart::alternative_plain_html(plain, html.clone())),
            None => builder.singlepart(SinglePart::plain(plain)),
        }
    } else {
        let mut mixed = match &reply.html {
            Some(html) => {
                MultiPart::mixed().multipart(MultiPart::alternative_plain_html(plain, html.clone()))
            }
            None => MultiPart::mixed().singlepart(SinglePart::plain(plain)),
        };
        for attachment in &reply.attachments {
            let contents = std::fs::read(&attachment.path).map_err(|e| {
                send_failed(format!(
                    "Cannot read attachment {}: {e}",
                    attachment.path.display()
                ))
            })?;
            let content_type = content_type(attachment.content_type.as_deref())?;
            mixed = mixed
                .singlepart(Attachment::new(attachment.display_name()).body(contents, content_type));
        }
        builder.multipart(mixed)
    };

    email.map_err(|e| send_failed(format!("Failed to build email: {e}")))
}

fn content_type(declared: Option<&str>) -> Result<ContentType, ChannelError> {
    declared
        .and_then(|ct| ContentType::parse(ct).ok())
        .map_or_else(|| ContentType::parse(OCTET_STREAM), Ok)
        .map_err(|e| send_failed(format!("Invalid content type: {e}")))
}

fn angle(id: &str) -> String {
    if id.starts_with('<') {
        id.to_string()
    } else {
        format!("<{id}>")
    }
}

fn send_failed(reason: String) -> ChannelError {
    ChannelError::SendFailed {
        name: "smtp".into(),
        reason,
    }
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    // Normalize whitespace
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}
