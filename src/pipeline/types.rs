//! Core types for the mail pipeline.

use async_trait::async_trait;
use serde::Serialize;

use crate::assistant::ResolvedReply;
use crate::channels::email_types::MessageMeta;
use crate::error::ChannelError;

// ── Channel traits ──────────────────────────────────────────────────

/// Inbound side of a mail channel: pure I/O, no business logic.
///
/// Trigger detection and the assistant run live in the mail processor.
#[async_trait]
pub trait MailSource: Send + Sync {
    /// Source name (e.g. "maildir").
    fn name(&self) -> &str;

    /// Fetch messages that have not been returned before.
    async fn fetch_new(&self) -> Result<Vec<MessageMeta>, ChannelError>;
}

/// Outbound side of a mail channel.
#[async_trait]
pub trait ReplySender: Send + Sync {
    /// Sender name (e.g. "smtp").
    fn name(&self) -> &str;

    /// Send `reply` to the author of `original`, threaded under it.
    async fn send_reply(
        &self,
        original: &MessageMeta,
        reply: &ResolvedReply,
    ) -> Result<(), ChannelError>;
}

// ── Cycle report ────────────────────────────────────────────────────

/// Counters for one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Messages returned by the source.
    pub fetched: usize,
    /// Messages that mentioned the trigger.
    pub triggered: usize,
    /// Replies delivered.
    pub replied: usize,
    /// Not sent: untriggered, self-sent, or answered with NO_REPLY.
    pub skipped: usize,
    /// Assistant or delivery failures.
    pub failed: usize,
}

impl CycleReport {
    /// Whether anything happened worth logging at info level.
    pub fn is_idle(&self) -> bool {
        self.fetched == 0
    }
}
