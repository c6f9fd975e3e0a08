use std::fmt;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::info;

use crate::events::ObjectId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatChannel {
    Say,
    Yell,
    Broadcast,
    System,
}

impl fmt::Display for ChatChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Say => "say",
            Self::Yell => "yell",
            Self::Broadcast => "broadcast",
            Self::System => "system",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
#[error("message sink unavailable: {reason}")]
pub struct SinkError {
    pub reason: String,
}

/// Fire-and-forget text output. Callers log failures and carry on.
pub trait MessageSink: Send + Sync {
    fn notify(&self, actor: ObjectId, text: &str, channel: ChatChannel) -> Result<(), SinkError>;
}

/// Writes every message to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MessageSink for TracingSink {
    fn notify(&self, actor: ObjectId, text: &str, channel: ChatChannel) -> Result<(), SinkError> {
        info!(actor = %actor, channel = %channel, text, "actor_message");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub actor: ObjectId,
    pub text: String,
    pub channel: ChatChannel,
}

/// Keeps every message in memory; used to observe flavor text.
#[derive(Debug, Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<SentMessage>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<SentMessage> {
        self.messages.lock().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.messages
            .lock()
            .iter()
            .any(|message| message.text.contains(needle))
    }
}

impl MessageSink for RecordingSink {
    fn notify(&self, actor: ObjectId, text: &str, channel: ChatChannel) -> Result<(), SinkError> {
        self.messages.lock().push(SentMessage {
            actor,
            text: text.to_string(),
            channel,
        });
        Ok(())
    }
}
