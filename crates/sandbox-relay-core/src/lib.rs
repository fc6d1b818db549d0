//! Wire model shared by the relay client, broker, and sandbox agent.
//!
//! This crate provides:
//! - `ChannelMessage` / `Envelope` - The typed frames exchanged on a channel
//! - `SessionMode` - Interactive vs. single-shot sessions
//! - `LaunchConfig` - The configuration blob handed to a sandbox at launch

pub mod launch;
pub mod message;

pub use launch::{LaunchConfig, LaunchConfigError, SessionMode};
pub use message::{ChannelMessage, Envelope};

/// Session identifier: an opaque, caller-generated string naming one
/// logical conversation and its channel.
pub type SessionId = String;

/// Current time as Unix epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
