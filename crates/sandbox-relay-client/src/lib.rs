//! Channel client: the requesting side of a relay session.
//!
//! Provides:
//! - `ChannelClient` - Connect/send/receive state machine
//! - `Backoff` - Exponential reconnect delays
//! - `ReconnectPolicy` - Manual vs. automatic reconnection

pub mod backoff;
pub mod client;

pub use backoff::{Backoff, BackoffConfig};
pub use client::{ChannelClient, ClientConfig, ClientError, ClientEvent, ConnectionState, ReconnectPolicy};
