//! Named-channel broadcast bus.
//!
//! One channel per session id, best-effort delivery, per-publisher FIFO
//! within a channel. `MemoryBus` is the in-process implementation; remote
//! buses plug in behind the same `MessageBus` trait.

pub mod memory;

use async_trait::async_trait;
use sandbox_relay_core::Envelope;
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::MemoryBus;

/// Bus error.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Bus is closed")]
    Closed,
    #[error("Subscribe failed: {0}")]
    Subscribe(String),
    #[error("Publish failed: {0}")]
    Publish(String),
}

/// An active subscription to one channel.
///
/// Frames arrive in publish order per publisher. Dropping the subscription
/// unsubscribes; `recv` returns `None` once the channel is gone.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Envelope>,
    _guard: Box<dyn std::any::Any + Send>,
}

impl Subscription {
    /// Build a subscription from a frame receiver and an unsubscribe guard.
    ///
    /// The guard's `Drop` must detach the underlying listener.
    #[must_use]
    pub fn new(rx: mpsc::UnboundedReceiver<Envelope>, guard: Box<dyn std::any::Any + Send>) -> Self {
        Self { rx, _guard: guard }
    }

    /// Receive the next frame, waiting if none is pending.
    ///
    /// Returns `None` when the channel has closed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }
}

/// A named-channel broadcast bus.
///
/// Publishing delivers to every current subscriber of the same channel;
/// there is no persistence and no replay.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Subscribe to a channel.
    ///
    /// # Errors
    /// Returns error if the bus rejects the subscription.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError>;

    /// Publish a frame to a channel.
    ///
    /// Resolving is the delivery acknowledgment; a channel with no
    /// subscribers accepts and drops the frame.
    ///
    /// # Errors
    /// Returns error if the bus refuses the publish.
    async fn publish(&self, channel: &str, envelope: Envelope) -> Result<(), BusError>;
}
