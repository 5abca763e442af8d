//! Mail pipeline.
//!
//! Every inbound message flows through:
//! 1. `MailSource::fetch_new()`: channel-specific I/O
//! 2. Trigger check: the configured marker in subject or body
//! 3. `Assistant::invoke()`: agent run and reply resolution
//! 4. `ReplySender::send_reply()`: unless the assistant answered NO_REPLY

pub mod mail_processor;
pub mod types;

pub use mail_processor::{process_once, spawn_mail_processor};
pub use types::{CycleReport, MailSource, ReplySender};
