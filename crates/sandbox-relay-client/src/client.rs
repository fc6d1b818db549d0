//! Connection state machine for the requesting side of a session.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use sandbox_relay_bus::{BusError, MessageBus, Subscription};
use sandbox_relay_core::{ChannelMessage, Envelope};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, timeout, timeout_at};

use crate::backoff::{Backoff, BackoffConfig};

/// Client-observed connection state.
///
/// Transitions are strictly `Disconnected -> Connecting -> Connected`,
/// falling back to `Disconnected` on timeout, error, or close. There is no
/// separate terminal state; a client may reconnect from `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Reconnection policy.
///
/// The defensive default is `Manual`: stale detection surfaces a
/// [`ClientEvent::StaleConnection`] and the caller decides when to call
/// [`ChannelClient::reconnect`]. `Auto` retries with exponential backoff
/// until a connect succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectPolicy {
    #[default]
    Manual,
    Auto,
}

/// Client error.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Channel name must not be empty")]
    NoChannelName,
    #[error("Not connected")]
    NotConnected,
    #[error("Subscribe failed: {0}")]
    SubscriptionFailed(String),
    #[error("Subscribe timed out")]
    SubscriptionTimedOut,
    #[error("Agent did not signal ready in time")]
    ReadyTimeout,
    #[error("Channel closed unexpectedly")]
    ChannelClosed,
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

/// Event surfaced to the client's owner.
#[derive(Debug)]
pub enum ClientEvent {
    /// Inbound content frame.
    Message(Envelope),
    /// No traffic for longer than the stale window; the client has already
    /// closed locally and expects the caller to prompt for reconnect.
    StaleConnection,
    /// The channel ended.
    Closed,
}

/// Client timing and policy knobs.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Ceiling on the subscribe handshake.
    pub subscribe_timeout: Duration,
    /// Ceiling on the wait for the sandbox's ready frame.
    pub ready_timeout: Duration,
    /// Silence window after which the connection is considered stale.
    pub stale_after: Duration,
    /// How often the stale window is checked.
    pub stale_check_interval: Duration,
    /// Reconnection policy.
    pub reconnect: ReconnectPolicy,
    /// Backoff parameters for automatic reconnection.
    pub backoff: BackoffConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            subscribe_timeout: Duration::from_secs(10),
            ready_timeout: Duration::from_secs(30),
            stale_after: Duration::from_secs(45),
            stale_check_interval: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// State machine wrapper around one channel subscription.
///
/// All transitions happen either inside a `&mut self` call or on the single
/// listener task; there is one pending operation at a time and no concurrent
/// `connect` against one instance.
pub struct ChannelClient<B: MessageBus> {
    bus: Arc<B>,
    config: ClientConfig,
    state: Arc<Mutex<ConnectionState>>,
    channel: Option<String>,
    listener: Option<tokio::task::JoinHandle<()>>,
    events: Option<mpsc::UnboundedReceiver<ClientEvent>>,
    backoff: Backoff,
}

impl<B: MessageBus + 'static> ChannelClient<B> {
    /// Create a disconnected client.
    #[must_use]
    pub fn new(bus: Arc<B>, config: ClientConfig) -> Self {
        let backoff = Backoff::new(config.backoff);
        Self {
            bus,
            config,
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            channel: None,
            listener: None,
            events: None,
            backoff,
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    /// Subscribe to `channel` and wait for the sandbox's ready frame.
    ///
    /// Resolves immediately if already connected. On any failure the state
    /// returns to `Disconnected`; the subscription is not retried here.
    ///
    /// # Errors
    /// `NoChannelName` for an empty name, `SubscriptionFailed` /
    /// `SubscriptionTimedOut` if the subscribe handshake is rejected or
    /// stalls, `ReadyTimeout` if no ready frame arrives in time, and
    /// `ChannelClosed` if the channel ends mid-handshake.
    pub async fn connect(&mut self, channel: &str) -> Result<(), ClientError> {
        if channel.is_empty() {
            return Err(ClientError::NoChannelName);
        }
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }
        self.teardown();
        self.set_state(ConnectionState::Connecting);

        let subscription = match timeout(
            self.config.subscribe_timeout,
            self.bus.subscribe(channel),
        )
        .await
        {
            Ok(Ok(subscription)) => subscription,
            Ok(Err(e)) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(ClientError::SubscriptionFailed(e.to_string()));
            }
            Err(_) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(ClientError::SubscriptionTimedOut);
            }
        };

        let subscription = match self.await_ready(subscription).await {
            Ok(subscription) => subscription,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        self.set_state(ConnectionState::Connected);
        self.backoff.reset();
        self.channel = Some(channel.to_string());

        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(rx);
        self.listener = Some(tokio::spawn(listen(
            subscription,
            Arc::clone(&self.state),
            tx,
            self.config.stale_after,
            self.config.stale_check_interval,
        )));

        tracing::debug!("connected to channel {channel}");
        Ok(())
    }

    /// Wait for the first ready frame, tolerating other traffic.
    async fn await_ready(&self, mut subscription: Subscription) -> Result<Subscription, ClientError> {
        let deadline = Instant::now() + self.config.ready_timeout;
        loop {
            match timeout_at(deadline, subscription.recv()).await {
                Ok(Some(envelope)) => {
                    if envelope.message == ChannelMessage::Ready {
                        return Ok(subscription);
                    }
                    // Not ready yet; anything else here is early noise.
                    tracing::debug!("frame before ready: {:?}", envelope.message);
                }
                Ok(None) => return Err(ClientError::ChannelClosed),
                Err(_) => return Err(ClientError::ReadyTimeout),
            }
        }
    }

    /// Publish a `user_message` frame.
    ///
    /// # Errors
    /// `NotConnected` unless the state is `Connected`; bus errors pass
    /// through.
    pub async fn send(&self, content: &str) -> Result<(), ClientError> {
        if self.state() != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        let channel = self.channel.as_ref().ok_or(ClientError::NotConnected)?;
        self.bus.publish(channel, Envelope::user_message(content)).await?;
        Ok(())
    }

    /// Next inbound event, or `None` when no subscription is active.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        match self.events.as_mut() {
            Some(events) => events.recv().await,
            None => None,
        }
    }

    /// Drop the subscription and return to `Disconnected`.
    ///
    /// The listener task (and with it the message handler) stops before the
    /// subscription is released, so no late status event can be observed
    /// against cleared state.
    pub fn disconnect(&mut self) {
        self.teardown();
        self.set_state(ConnectionState::Disconnected);
    }

    /// Reconnect to the last channel according to the configured policy.
    ///
    /// `Manual` makes a single attempt. `Auto` retries with exponential
    /// backoff until an attempt succeeds, returning early only for
    /// non-retryable errors.
    ///
    /// # Errors
    /// `NoChannelName` if the client has never connected; otherwise as
    /// [`Self::connect`].
    pub async fn reconnect(&mut self) -> Result<(), ClientError> {
        let channel = self.channel.clone().ok_or(ClientError::NoChannelName)?;
        match self.config.reconnect {
            ReconnectPolicy::Manual => self.connect(&channel).await,
            ReconnectPolicy::Auto => loop {
                match self.connect(&channel).await {
                    Ok(()) => return Ok(()),
                    Err(e @ ClientError::NoChannelName) => return Err(e),
                    Err(e) => {
                        let delay = self.backoff.next_delay();
                        tracing::warn!("reconnect failed ({e}), retrying in {delay:?}");
                        tokio::time::sleep(delay).await;
                    }
                }
            },
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    fn teardown(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        self.events = None;
    }
}

impl<B: MessageBus> Drop for ChannelClient<B> {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

/// Listener task: forwards content frames, tracks activity, watches for
/// staleness. Owns the subscription; returning drops it, which unsubscribes.
async fn listen(
    mut subscription: Subscription,
    state: Arc<Mutex<ConnectionState>>,
    tx: mpsc::UnboundedSender<ClientEvent>,
    stale_after: Duration,
    check_interval: Duration,
) {
    let mut last_activity = Instant::now();
    let mut check = tokio::time::interval(check_interval);
    check.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = subscription.recv() => match frame {
                Some(envelope) => {
                    last_activity = Instant::now();
                    match envelope.message {
                        // A repeat ready must not disturb the state machine.
                        ChannelMessage::Ready => {}
                        // Heartbeats refresh activity but are not content.
                        ChannelMessage::Heartbeat => {}
                        // Own outbound frames come back through the broadcast.
                        ChannelMessage::UserMessage { .. } => {}
                        _ => {
                            if tx.send(ClientEvent::Message(envelope)).is_err() {
                                break;
                            }
                        }
                    }
                }
                None => {
                    *state.lock().unwrap() = ConnectionState::Disconnected;
                    let _ = tx.send(ClientEvent::Closed);
                    break;
                }
            },
            _ = check.tick() => {
                if last_activity.elapsed() > stale_after {
                    tracing::warn!("no channel traffic for {stale_after:?}, closing locally");
                    *state.lock().unwrap() = ConnectionState::Disconnected;
                    let _ = tx.send(ClientEvent::StaleConnection);
                    break;
                }
            }
        }
    }
}
