//! Scribebot: a Slack incident scribe that keeps a live Google Doc report updated.
//!
//! The bot watches an incident channel, folds new messages into a per-channel
//! conversation history, and periodically asks a language model which document
//! edits (title, priority, status lists) to apply to the channel's report.

pub mod config;
pub mod conversation;
pub mod docs;
pub mod error;
pub mod llm;
pub mod scheduler;
pub mod slack;
pub mod tools;

pub use error::{Error, Result};

use std::sync::Arc;

/// Channel identifier type.
pub type ChannelId = Arc<str>;

/// Inbound event from the chat platform, already filtered and attributed.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub channel: ChannelId,
    pub kind: InboundEventKind,
}

/// Event variants the scheduler cares about.
#[derive(Debug, Clone)]
pub enum InboundEventKind {
    /// A user message. `sender` is the resolved display name.
    Message { sender: String, text: String },
    /// The bot itself was added to the channel. Reserved hook, currently a no-op.
    BotJoined,
    /// The bot was removed from the channel. Conversation state is retained.
    BotRemoved,
}

/// Outbound notification to be posted back to the originating channel.
#[derive(Debug, Clone)]
pub struct OutboundNotice {
    pub channel: ChannelId,
    pub text: String,
}
