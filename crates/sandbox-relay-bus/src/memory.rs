//! In-process bus implementation.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use sandbox_relay_core::Envelope;
use tokio::sync::{broadcast, mpsc};

use crate::{BusError, MessageBus, Subscription};

/// Broadcast buffer per channel.
const CHANNEL_CAPACITY: usize = 1024;

struct ChannelEntry {
    sender: broadcast::Sender<Envelope>,
    subscribers: usize,
}

struct Inner {
    channels: HashMap<String, ChannelEntry>,
    closed: bool,
}

/// In-process message bus backed by per-channel broadcast senders.
///
/// Useful for single-process deployments and tests. Channels are created
/// on first subscribe and removed when the last subscriber drops.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBus {
    /// Create a new bus with no channels.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                channels: HashMap::new(),
                closed: false,
            })),
        }
    }

    /// Shut the bus down: existing subscriptions end, new operations fail.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        inner.channels.clear();
    }

    /// Number of live channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .channels
            .len()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Detaches one subscriber on drop, removing the channel when it was the
/// last one.
struct Unsubscribe {
    inner: Arc<Mutex<Inner>>,
    channel: String,
    forwarder: tokio::task::JoinHandle<()>,
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.forwarder.abort();
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.channels.get_mut(&self.channel) {
            entry.subscribers = entry.subscribers.saturating_sub(1);
            if entry.subscribers == 0 {
                inner.channels.remove(&self.channel);
            }
        }
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError> {
        let rx = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Err(BusError::Closed);
            }
            let entry = inner
                .channels
                .entry(channel.to_string())
                .or_insert_with(|| ChannelEntry {
                    sender: broadcast::channel(CHANNEL_CAPACITY).0,
                    subscribers: 0,
                });
            entry.subscribers += 1;
            entry.sender.subscribe()
        };

        let (tx, frames) = mpsc::unbounded_channel();
        let name = channel.to_string();
        let forwarder = tokio::spawn(forward(rx, tx, name));

        Ok(Subscription::new(
            frames,
            Box::new(Unsubscribe {
                inner: Arc::clone(&self.inner),
                channel: channel.to_string(),
                forwarder,
            }),
        ))
    }

    async fn publish(&self, channel: &str, envelope: Envelope) -> Result<(), BusError> {
        let inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(BusError::Closed);
        }
        match inner.channels.get(channel) {
            // A send error means no live receivers; delivery is best-effort.
            Some(entry) => {
                let _ = entry.sender.send(envelope);
            }
            None => {
                tracing::trace!("dropping frame for channel {channel} with no subscribers");
            }
        }
        Ok(())
    }
}

async fn forward(
    mut rx: broadcast::Receiver<Envelope>,
    tx: mpsc::UnboundedSender<Envelope>,
    channel: String,
) {
    loop {
        match rx.recv().await {
            Ok(envelope) => {
                if tx.send(envelope).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("subscriber on channel {channel} lagged, dropped {n} frames");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
