//! Typed channel frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::now_millis;

/// Message exchanged on a session channel.
///
/// The variant set is closed: frames with an unknown `type` fail to
/// deserialize, and receivers log and drop them rather than crash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    /// Liveness signal from the sandbox: subscribed and accepting input.
    Ready,
    /// Inbound content from the client.
    UserMessage { content: String },
    /// Streamed agent text output.
    AssistantMessage { content: String },
    /// Agent tool invocation.
    ToolUse { tool_name: String, tool_input: Value },
    /// Raw command output from the agent.
    CommandOutput { text: String },
    /// Failure report; terminal for single-shot sessions.
    Error { message: String },
    /// Single-shot result; always the final frame of a successful run.
    Complete { result: String },
    /// Periodic liveness signal while a session idles.
    Heartbeat,
}

impl ChannelMessage {
    /// Whether this frame ends a single-shot session.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Complete { .. })
    }

    /// Whether this frame counts as session activity for idle tracking.
    ///
    /// Heartbeats keep a connection fresh on the client side but do not
    /// keep an idle sandbox alive.
    #[must_use]
    pub const fn is_activity(&self) -> bool {
        !matches!(self, Self::Heartbeat)
    }
}

/// A channel frame plus the moment it was constructed.
///
/// Serializes flat: `{"type": "...", "timestamp": ..., ...fields}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unix epoch milliseconds at construction.
    pub timestamp: i64,
    #[serde(flatten)]
    pub message: ChannelMessage,
}

impl Envelope {
    /// Wrap a message, stamping the current time.
    #[must_use]
    pub fn new(message: ChannelMessage) -> Self {
        Self {
            timestamp: now_millis(),
            message,
        }
    }

    /// Shorthand for a stamped `user_message` frame.
    #[must_use]
    pub fn user_message(content: impl Into<String>) -> Self {
        Self::new(ChannelMessage::UserMessage {
            content: content.into(),
        })
    }
}

impl From<ChannelMessage> for Envelope {
    fn from(message: ChannelMessage) -> Self {
        Self::new(message)
    }
}
