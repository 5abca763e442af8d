//! Mail channels: Maildir inbound, SMTP outbound.

pub mod email;
pub mod email_types;
pub mod maildir;

pub use email::SmtpSender;
pub use email_types::{InboundAttachment, MessageMeta};
pub use maildir::MaildirSource;
