//! Session orchestration and idle supervision.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use sandbox_relay_bus::{BusError, MessageBus, Subscription};
use sandbox_relay_core::{LaunchConfig, SessionMode};
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, MissedTickBehavior};

use crate::driver::{SandboxDriver, SandboxError};
use crate::registry::{SessionEntry, SessionRegistry};
use crate::verify::{AuthError, IdentityVerifier};

/// Broker error.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Unauthenticated: {0}")]
    Unauthenticated(#[from] AuthError),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

/// Broker timing and channel settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Quiet period after which an idle single-shot sandbox is destroyed.
    pub idle_timeout: Duration,
    /// How often the quiet period is checked.
    pub check_interval: Duration,
    /// Bus endpoint handed to launched agents.
    pub channel_endpoint: String,
    /// Bus credential handed to launched agents.
    pub channel_credential: String,
    /// Agent payload injected when a start request carries none.
    pub default_payload: Vec<u8>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            check_interval: Duration::from_secs(60),
            channel_endpoint: "memory://local".into(),
            channel_credential: String::new(),
            default_payload: Vec::new(),
        }
    }
}

/// Start-session request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    /// Caller-generated session identifier; doubles as the channel name.
    pub session_id: String,
    /// Session mode.
    pub mode: SessionMode,
    /// Literal task payload; required in single-shot mode.
    #[serde(default)]
    pub task: Option<String>,
    /// Base64 agent payload overriding the broker default.
    #[serde(default)]
    pub payload: Option<String>,
}

/// Start-session response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartResponse {
    pub status: String,
    pub channel_name: String,
    pub process_id: String,
}

/// Stateless-per-request session broker.
///
/// Authenticates callers, provisions sandboxes through the driver, launches
/// agent processes, and runs one inactivity supervisor task per single-shot
/// session. The broker alone owns sandbox lifecycle decisions.
pub struct SessionBroker<V, D, B>
where
    V: IdentityVerifier,
    D: SandboxDriver,
    B: MessageBus,
{
    verifier: V,
    driver: Arc<D>,
    bus: Arc<B>,
    registry: Arc<SessionRegistry>,
    config: BrokerConfig,
}

impl<V, D, B> SessionBroker<V, D, B>
where
    V: IdentityVerifier,
    D: SandboxDriver + 'static,
    B: MessageBus + 'static,
{
    /// Create a broker.
    #[must_use]
    pub fn new(verifier: V, driver: Arc<D>, bus: Arc<B>, config: BrokerConfig) -> Self {
        Self {
            verifier,
            driver,
            bus,
            registry: Arc::new(SessionRegistry::new()),
            config,
        }
    }

    /// The session table.
    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Start (or restart) the session named by the request.
    ///
    /// Verifies the credential before any sandbox or channel activity,
    /// provisions the sandbox, injects the agent payload, and launches the
    /// agent process. Returns without waiting for the agent's `ready`
    /// frame; callers must watch the channel for it.
    ///
    /// # Errors
    /// `Unauthenticated` for a missing/invalid credential,
    /// `InvalidRequest` for a malformed request, and driver/bus errors
    /// otherwise. Failures leave no registry entry or supervisor behind.
    pub async fn start_session(
        &self,
        request: StartRequest,
        credential: Option<&str>,
    ) -> Result<StartResponse, BrokerError> {
        let caller = self.verifier.verify(credential).await?;

        if request.session_id.is_empty() {
            return Err(BrokerError::InvalidRequest(
                "session_id must not be empty".into(),
            ));
        }
        if request.mode == SessionMode::SingleShot
            && request.task.as_ref().is_none_or(|t| t.is_empty())
        {
            return Err(BrokerError::InvalidRequest(
                "single-shot session requires a task".into(),
            ));
        }
        let payload = match &request.payload {
            Some(encoded) => BASE64
                .decode(encoded)
                .map_err(|e| BrokerError::InvalidRequest(format!("invalid payload: {e}")))?,
            None => self.config.default_payload.clone(),
        };

        // Idempotent restart: the sandbox is reused, the old supervisor is
        // replaced.
        if let Some(mut previous) = self.registry.remove(&request.session_id) {
            tracing::info!("restarting existing session {}", request.session_id);
            if let Some(supervisor) = previous.supervisor.take() {
                supervisor.abort();
            }
        }

        let session_id = request.session_id.clone();
        self.driver.provision(&session_id).await?;
        if let Err(e) = self.driver.inject_payload(&session_id, &payload).await {
            // No dangling sandbox on a failed start.
            let _ = self.driver.destroy(&session_id).await;
            return Err(e.into());
        }

        let launch = LaunchConfig {
            mode: request.mode,
            session_id: session_id.clone(),
            caller_identity: caller,
            channel_endpoint: self.config.channel_endpoint.clone(),
            channel_credential: self.config.channel_credential.clone(),
            task: request.task.clone(),
        };
        let process_id = match self.driver.launch(&session_id, &launch).await {
            Ok(process_id) => process_id,
            Err(e) => {
                let _ = self.driver.destroy(&session_id).await;
                return Err(e.into());
            }
        };

        let destroyed = Arc::new(AtomicBool::new(false));
        let supervisor = match request.mode {
            SessionMode::SingleShot => {
                let subscription = match self.bus.subscribe(&session_id).await {
                    Ok(subscription) => subscription,
                    Err(e) => {
                        // No dangling sandbox or timer on a failed start.
                        let _ = self.driver.destroy(&session_id).await;
                        return Err(e.into());
                    }
                };
                Some(tokio::spawn(supervise(
                    subscription,
                    Arc::clone(&self.driver),
                    Arc::clone(&self.registry),
                    session_id.clone(),
                    Arc::clone(&destroyed),
                    self.config.idle_timeout,
                    self.config.check_interval,
                )))
            }
            SessionMode::Interactive => None,
        };

        self.registry.insert(
            session_id.clone(),
            SessionEntry {
                process_id: process_id.clone(),
                mode: request.mode,
                supervisor,
                destroyed,
            },
        );

        Ok(StartResponse {
            status: "started".into(),
            channel_name: session_id,
            process_id,
        })
    }

    /// Reset the sandbox's idle-sleep timer.
    ///
    /// Best-effort: an already-asleep or unknown sandbox is informational,
    /// never a hard failure.
    ///
    /// # Errors
    /// `Unauthenticated` only; driver trouble is logged and swallowed.
    pub async fn keepalive(
        &self,
        session_id: &str,
        credential: Option<&str>,
    ) -> Result<(), BrokerError> {
        self.verifier.verify(credential).await?;
        if let Err(e) = self.driver.touch(session_id).await {
            tracing::debug!("keepalive for {session_id}: {e}");
        }
        Ok(())
    }

    /// Explicitly tear a session down.
    ///
    /// Shares the destroy-once guard with the inactivity supervisor, so
    /// racing the periodic check is safe.
    ///
    /// # Errors
    /// `Unauthenticated` for a bad credential; destroying an unknown
    /// session succeeds.
    pub async fn stop_session(
        &self,
        session_id: &str,
        credential: Option<&str>,
    ) -> Result<(), BrokerError> {
        self.verifier.verify(credential).await?;
        let Some(mut entry) = self.registry.remove(session_id) else {
            return Ok(());
        };
        if let Some(supervisor) = entry.supervisor.take() {
            supervisor.abort();
        }
        if entry.claim_destroy() {
            self.driver.destroy(session_id).await?;
        }
        Ok(())
    }
}

/// Inactivity supervisor for one single-shot session.
///
/// Observes channel traffic, and destroys the sandbox once the quiet
/// period exceeds the idle ceiling. Heartbeats keep a client connection
/// fresh but do not count as activity here; otherwise a wedged agent that
/// still heartbeats would never be reaped.
async fn supervise<D: SandboxDriver>(
    mut subscription: Subscription,
    driver: Arc<D>,
    registry: Arc<SessionRegistry>,
    session_id: String,
    destroyed: Arc<AtomicBool>,
    idle_timeout: Duration,
    check_interval: Duration,
) {
    let mut last_activity = Instant::now();
    let mut ticker = tokio::time::interval(check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // the first tick is immediate

    loop {
        tokio::select! {
            frame = subscription.recv() => match frame {
                Some(envelope) => {
                    if envelope.message.is_activity() {
                        last_activity = Instant::now();
                    }
                }
                None => {
                    tracing::debug!("channel for {session_id} ended, supervisor tearing down");
                    break;
                }
            },
            _ = ticker.tick() => {
                let quiet = last_activity.elapsed();
                if quiet >= idle_timeout {
                    tracing::info!("session {session_id} quiet for {quiet:?}, destroying sandbox");
                    break;
                }
            }
        }
    }

    // Teardown exactly once, tolerating a concurrent explicit stop. The
    // subscription and ticker are released when this task returns.
    if !destroyed.swap(true, Ordering::SeqCst) {
        if let Err(e) = driver.destroy(&session_id).await {
            tracing::error!("failed to destroy sandbox for {session_id}: {e}");
        }
    }
    // A restart may have replaced the entry while we were destroying; only
    // remove the one this supervisor owns.
    registry.remove_guarded(&session_id, &destroyed);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use sandbox_relay_bus::MemoryBus;
    use sandbox_relay_core::Envelope;

    use crate::verify::StaticTokenVerifier;

    use super::*;

    struct MockDriver {
        launches: AtomicUsize,
        destroys: AtomicUsize,
        fail_provision: bool,
        fail_launch: bool,
    }

    impl MockDriver {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                launches: AtomicUsize::new(0),
                destroys: AtomicUsize::new(0),
                fail_provision: false,
                fail_launch: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                launches: AtomicUsize::new(0),
                destroys: AtomicUsize::new(0),
                fail_provision: true,
                fail_launch: false,
            })
        }

        fn launch_failing() -> Arc<Self> {
            Arc::new(Self {
                launches: AtomicUsize::new(0),
                destroys: AtomicUsize::new(0),
                fail_provision: false,
                fail_launch: true,
            })
        }

        fn destroy_count(&self) -> usize {
            self.destroys.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl SandboxDriver for MockDriver {
        async fn provision(&self, session_id: &str) -> Result<(), SandboxError> {
            if self.fail_provision {
                return Err(SandboxError::NotProvisioned(session_id.to_string()));
            }
            Ok(())
        }

        async fn inject_payload(&self, _session_id: &str, _payload: &[u8]) -> Result<(), SandboxError> {
            Ok(())
        }

        async fn launch(&self, _session_id: &str, config: &LaunchConfig) -> Result<String, SandboxError> {
            config.validate()?;
            if self.fail_launch {
                return Err(SandboxError::ExecutableNotFound("agent".into()));
            }
            let n = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("pid-{n}"))
        }

        async fn touch(&self, _session_id: &str) -> Result<(), SandboxError> {
            Ok(())
        }

        async fn destroy(&self, _session_id: &str) -> Result<(), SandboxError> {
            self.destroys.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    type TestBroker = SessionBroker<StaticTokenVerifier, MockDriver, MemoryBus>;

    fn broker(driver: Arc<MockDriver>, bus: Arc<MemoryBus>, config: BrokerConfig) -> TestBroker {
        SessionBroker::new(
            StaticTokenVerifier::new("secret", "ops@example.com"),
            driver,
            bus,
            config,
        )
    }

    fn fast_config() -> BrokerConfig {
        BrokerConfig {
            idle_timeout: Duration::from_millis(150),
            check_interval: Duration::from_millis(40),
            ..BrokerConfig::default()
        }
    }

    fn single_shot(session_id: &str, task: &str) -> StartRequest {
        StartRequest {
            session_id: session_id.into(),
            mode: SessionMode::SingleShot,
            task: Some(task.into()),
            payload: None,
        }
    }

    fn interactive(session_id: &str) -> StartRequest {
        StartRequest {
            session_id: session_id.into(),
            mode: SessionMode::Interactive,
            task: None,
            payload: None,
        }
    }

    #[tokio::test]
    async fn test_rejects_bad_credentials() {
        let driver = MockDriver::new();
        let broker = broker(Arc::clone(&driver), Arc::new(MemoryBus::new()), fast_config());

        for credential in [None, Some("wrong")] {
            let result = broker
                .start_session(interactive("s1"), credential)
                .await;
            assert!(matches!(result, Err(BrokerError::Unauthenticated(_))));
        }
        // Rejected before any sandbox activity.
        assert_eq!(driver.launches.load(Ordering::SeqCst), 0);
        assert!(broker.registry().is_empty());
    }

    #[tokio::test]
    async fn test_validates_request() {
        let broker = broker(MockDriver::new(), Arc::new(MemoryBus::new()), fast_config());

        let result = broker
            .start_session(interactive(""), Some("secret"))
            .await;
        assert!(matches!(result, Err(BrokerError::InvalidRequest(_))));

        let mut request = single_shot("s1", "task");
        request.task = None;
        let result = broker.start_session(request, Some("secret")).await;
        assert!(matches!(result, Err(BrokerError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_start_returns_channel_and_process() {
        let broker = broker(MockDriver::new(), Arc::new(MemoryBus::new()), fast_config());

        let response = broker
            .start_session(single_shot("s2", "list todos"), Some("secret"))
            .await
            .unwrap();
        assert_eq!(response.status, "started");
        assert_eq!(response.channel_name, "s2");
        assert!(!response.process_id.is_empty());
        assert!(broker.registry().contains("s2"));
    }

    #[tokio::test]
    async fn test_restart_is_idempotent() {
        let driver = MockDriver::new();
        let broker = broker(Arc::clone(&driver), Arc::new(MemoryBus::new()), fast_config());

        broker
            .start_session(interactive("s1"), Some("secret"))
            .await
            .unwrap();
        broker
            .start_session(interactive("s1"), Some("secret"))
            .await
            .unwrap();

        assert_eq!(broker.registry().len(), 1);
        assert_eq!(driver.launches.load(Ordering::SeqCst), 2);
        // Restart reuses the sandbox rather than destroying it.
        assert_eq!(driver.destroy_count(), 0);
    }

    #[tokio::test]
    async fn test_launch_failure_destroys_provisioned_sandbox() {
        let driver = MockDriver::launch_failing();
        let bus = Arc::new(MemoryBus::new());
        let broker = broker(Arc::clone(&driver), Arc::clone(&bus), fast_config());

        let result = broker
            .start_session(single_shot("s1", "task"), Some("secret"))
            .await;
        assert!(matches!(result, Err(BrokerError::Sandbox(_))));
        // The sandbox provisioned before the failed launch must not linger.
        assert_eq!(driver.destroy_count(), 1);
        assert!(broker.registry().is_empty());
        assert_eq!(bus.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_provision_failure_leaves_no_state() {
        let bus = Arc::new(MemoryBus::new());
        let broker = broker(MockDriver::failing(), Arc::clone(&bus), fast_config());

        let result = broker
            .start_session(single_shot("s1", "task"), Some("secret"))
            .await;
        assert!(matches!(result, Err(BrokerError::Sandbox(_))));
        assert!(broker.registry().is_empty());
        assert_eq!(bus.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_idle_single_shot_destroyed_within_window() {
        let driver = MockDriver::new();
        let broker = broker(Arc::clone(&driver), Arc::new(MemoryBus::new()), fast_config());

        broker
            .start_session(single_shot("s1", "task"), Some("secret"))
            .await
            .unwrap();
        // Not yet idle past the ceiling.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(driver.destroy_count(), 0);

        // Past idle_timeout + check_interval, the sandbox must be gone.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(driver.destroy_count(), 1);
        assert!(broker.registry().is_empty());
    }

    #[tokio::test]
    async fn test_activity_defers_teardown() {
        let driver = MockDriver::new();
        let bus = Arc::new(MemoryBus::new());
        let broker = broker(Arc::clone(&driver), Arc::clone(&bus), fast_config());

        broker
            .start_session(single_shot("s1", "task"), Some("secret"))
            .await
            .unwrap();

        // Keep the channel busy past the idle ceiling.
        for _ in 0..6 {
            bus.publish("s1", Envelope::user_message("ping")).await.unwrap();
            tokio::time::sleep(Duration::from_millis(60)).await;
        }
        assert_eq!(driver.destroy_count(), 0);

        // Silence now lets the supervisor fire.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(driver.destroy_count(), 1);
    }

    #[tokio::test]
    async fn test_heartbeats_do_not_defer_teardown() {
        let driver = MockDriver::new();
        let bus = Arc::new(MemoryBus::new());
        let broker = broker(Arc::clone(&driver), Arc::clone(&bus), fast_config());

        broker
            .start_session(single_shot("s1", "task"), Some("secret"))
            .await
            .unwrap();

        // A wedged agent that still heartbeats must be reaped anyway.
        for _ in 0..10 {
            bus.publish("s1", Envelope::new(sandbox_relay_core::ChannelMessage::Heartbeat))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(60)).await;
        }
        assert_eq!(driver.destroy_count(), 1);
    }

    #[tokio::test]
    async fn test_interactive_sessions_are_not_supervised() {
        let driver = MockDriver::new();
        let broker = broker(Arc::clone(&driver), Arc::new(MemoryBus::new()), fast_config());

        broker
            .start_session(interactive("s1"), Some("secret"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(driver.destroy_count(), 0);
        assert!(broker.registry().contains("s1"));
    }

    #[tokio::test]
    async fn test_stop_races_supervisor_destroy_once() {
        let driver = MockDriver::new();
        let broker = broker(Arc::clone(&driver), Arc::new(MemoryBus::new()), fast_config());

        broker
            .start_session(single_shot("s1", "task"), Some("secret"))
            .await
            .unwrap();
        broker.stop_session("s1", Some("secret")).await.unwrap();
        assert_eq!(driver.destroy_count(), 1);

        // The supervisor tick after the explicit stop must not destroy again.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(driver.destroy_count(), 1);
        assert!(broker.registry().is_empty());
    }

    #[tokio::test]
    async fn test_keepalive_is_informational() {
        let broker = broker(MockDriver::new(), Arc::new(MemoryBus::new()), fast_config());
        // Unknown session: still ok.
        broker.keepalive("ghost", Some("secret")).await.unwrap();
        // Bad credential: still an auth failure.
        assert!(matches!(
            broker.keepalive("ghost", None).await,
            Err(BrokerError::Unauthenticated(_))
        ));
    }
}
