//! The agent loop: one run per sandbox process lifetime.

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use sandbox_relay_bus::{BusError, MessageBus, Subscription};
use sandbox_relay_core::{
    ChannelMessage, Envelope, LaunchConfig, LaunchConfigError, SessionMode,
};
use thiserror::Error;

use crate::agent::{Agent, AgentOutput, StepError};
use crate::inbox::Inbox;

/// Agent loop error.
///
/// Step-function failures never surface here; they are published to the
/// channel as `error` frames. Only bus and launch failures escape.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
    #[error("Invalid launch config: {0}")]
    Launch(#[from] LaunchConfigError),
}

/// Agent loop tuning.
#[derive(Debug, Clone)]
pub struct AgentLoopConfig {
    /// How often a heartbeat frame is published while the loop runs.
    pub heartbeat_interval: Duration,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
        }
    }
}

/// Bridges the session channel to the agent's step function.
///
/// Subscribes, signals `ready`, then drives the agent: interactive mode
/// pulls inbound messages through an [`Inbox`] until the channel ends;
/// single-shot mode runs the launch task once and publishes exactly one
/// terminal frame (`complete` on success, `error` on failure).
pub struct AgentLoop<B: MessageBus, A: Agent> {
    bus: Arc<B>,
    agent: Arc<A>,
    launch: LaunchConfig,
    config: AgentLoopConfig,
}

impl<B: MessageBus + 'static, A: Agent + 'static> AgentLoop<B, A> {
    /// Create a loop for one sandbox process.
    #[must_use]
    pub const fn new(bus: Arc<B>, agent: Arc<A>, launch: LaunchConfig, config: AgentLoopConfig) -> Self {
        Self {
            bus,
            agent,
            launch,
            config,
        }
    }

    /// Run to completion.
    ///
    /// # Errors
    /// Returns error if the launch config is inconsistent or the bus fails
    /// before a failure could be reported on the channel.
    pub async fn run(self) -> Result<(), AgentError> {
        self.launch.validate()?;

        let channel = self.launch.session_id.clone();
        let subscription = self.bus.subscribe(&channel).await?;
        self.publish(ChannelMessage::Ready).await?;
        tracing::info!("agent loop ready on channel {channel}");

        let heartbeat = self.spawn_heartbeat();
        let result = match self.launch.mode {
            SessionMode::SingleShot => self.run_single_shot(subscription).await,
            SessionMode::Interactive => self.run_interactive(subscription).await,
        };
        heartbeat.abort();
        result
    }

    /// One step against the launch task, then one terminal frame.
    async fn run_single_shot(&self, subscription: Subscription) -> Result<(), AgentError> {
        let task = self.launch.task.clone().unwrap_or_default();
        match self.run_step(&task).await? {
            Ok(result) => self.publish(ChannelMessage::Complete { result }).await?,
            Err(e) => {
                self.publish(ChannelMessage::Error { message: e.to_string() })
                    .await?;
            }
        }
        // Dropping the subscription unsubscribes; the process exits after us.
        drop(subscription);
        Ok(())
    }

    /// Pull inbound messages until the channel ends or a step fails.
    async fn run_interactive(&self, subscription: Subscription) -> Result<(), AgentError> {
        let inbox = Arc::new(Inbox::new());
        let listener = spawn_listener(subscription, Arc::clone(&inbox));

        let mut outcome = Ok(());
        while let Some(input) = inbox.next().await {
            match self.run_step(&input).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    self.publish(ChannelMessage::Error { message: e.to_string() })
                        .await?;
                    break;
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        // Teardown: end the queue for any parked consumer, then drop the
        // subscription by stopping the listener.
        inbox.close();
        listener.abort();
        outcome
    }

    /// Run one step, republishing each output unit in emission order.
    ///
    /// Outer error: bus failure. Inner error: the step function failed and
    /// the caller must report it on the channel.
    async fn run_step(&self, input: &str) -> Result<Result<String, StepError>, AgentError> {
        let mut stream = self.agent.step(input).await;
        let mut transcript = String::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(output) => {
                    if let AgentOutput::Assistant(content) = &output {
                        if !transcript.is_empty() {
                            transcript.push('\n');
                        }
                        transcript.push_str(content);
                    }
                    self.publish(ChannelMessage::from(output)).await?;
                }
                Err(e) => return Ok(Err(e)),
            }
        }
        Ok(Ok(transcript))
    }

    async fn publish(&self, message: ChannelMessage) -> Result<(), AgentError> {
        self.bus
            .publish(&self.launch.session_id, Envelope::new(message))
            .await?;
        Ok(())
    }

    fn spawn_heartbeat(&self) -> tokio::task::JoinHandle<()> {
        let bus = Arc::clone(&self.bus);
        let channel = self.launch.session_id.clone();
        let interval = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // the first tick is immediate
            loop {
                ticker.tick().await;
                if bus
                    .publish(&channel, Envelope::new(ChannelMessage::Heartbeat))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        })
    }
}

/// Bus listener: appends inbound `user_message` frames to the inbox,
/// closing it when the channel ends. Owns the subscription.
fn spawn_listener(mut subscription: Subscription, inbox: Arc<Inbox>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match subscription.recv().await {
                Some(envelope) => {
                    if let ChannelMessage::UserMessage { content } = envelope.message {
                        if !inbox.push(content) {
                            break;
                        }
                    }
                }
                None => {
                    inbox.close();
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use sandbox_relay_bus::MemoryBus;

    use crate::script::ScriptedAgent;

    use super::*;

    fn launch(mode: SessionMode, task: Option<&str>) -> LaunchConfig {
        LaunchConfig {
            mode,
            session_id: "s1".into(),
            caller_identity: "tester".into(),
            channel_endpoint: "memory://local".into(),
            channel_credential: "token".into(),
            task: task.map(Into::into),
        }
    }

    fn test_config() -> AgentLoopConfig {
        AgentLoopConfig {
            heartbeat_interval: Duration::from_secs(60),
        }
    }

    async fn collect_until_terminal(sub: &mut Subscription) -> Vec<ChannelMessage> {
        let mut frames = Vec::new();
        loop {
            let envelope = tokio::time::timeout(Duration::from_secs(2), sub.recv())
                .await
                .expect("frame before timeout")
                .expect("channel open");
            let terminal = envelope.message.is_terminal();
            frames.push(envelope.message);
            if terminal {
                return frames;
            }
        }
    }

    struct FailingAgent;

    #[async_trait]
    impl Agent for FailingAgent {
        async fn step(&self, input: &str) -> BoxStream<'static, Result<AgentOutput, StepError>> {
            let items = vec![
                Ok(AgentOutput::Assistant(format!("working on {input}"))),
                Err(StepError("tool crashed".into())),
            ];
            futures::stream::iter(items).boxed()
        }
    }

    #[tokio::test]
    async fn test_single_shot_ready_then_one_complete() {
        let bus = Arc::new(MemoryBus::new());
        let mut observer = bus.subscribe("s1").await.unwrap();

        let agent_loop = AgentLoop::new(
            Arc::clone(&bus),
            Arc::new(ScriptedAgent::echo()),
            launch(SessionMode::SingleShot, Some("add milk to todos")),
            test_config(),
        );
        agent_loop.run().await.unwrap();

        let frames = collect_until_terminal(&mut observer).await;
        assert_eq!(frames[0], ChannelMessage::Ready);
        assert_eq!(
            frames[1],
            ChannelMessage::AssistantMessage { content: "echo: add milk to todos".into() }
        );
        let completes = frames
            .iter()
            .filter(|m| matches!(m, ChannelMessage::Complete { .. }))
            .count();
        let errors = frames
            .iter()
            .filter(|m| matches!(m, ChannelMessage::Error { .. }))
            .count();
        assert_eq!((completes, errors), (1, 0));
    }

    #[tokio::test]
    async fn test_single_shot_failure_publishes_one_error() {
        let bus = Arc::new(MemoryBus::new());
        let mut observer = bus.subscribe("s1").await.unwrap();

        let agent_loop = AgentLoop::new(
            Arc::clone(&bus),
            Arc::new(FailingAgent),
            launch(SessionMode::SingleShot, Some("boom")),
            test_config(),
        );
        agent_loop.run().await.unwrap();

        let frames = collect_until_terminal(&mut observer).await;
        // Output emitted before the failure still went out, in order.
        assert!(matches!(frames[1], ChannelMessage::AssistantMessage { .. }));
        let completes = frames
            .iter()
            .filter(|m| matches!(m, ChannelMessage::Complete { .. }))
            .count();
        let errors = frames
            .iter()
            .filter(|m| matches!(m, ChannelMessage::Error { .. }))
            .count();
        assert_eq!((completes, errors), (0, 1));
    }

    #[tokio::test]
    async fn test_single_shot_without_task_rejected() {
        let bus = Arc::new(MemoryBus::new());
        let agent_loop = AgentLoop::new(
            bus,
            Arc::new(ScriptedAgent::echo()),
            launch(SessionMode::SingleShot, None),
            test_config(),
        );
        assert!(matches!(agent_loop.run().await, Err(AgentError::Launch(_))));
    }

    #[tokio::test]
    async fn test_interactive_echoes_in_publish_order() {
        let bus = Arc::new(MemoryBus::new());
        let mut observer = bus.subscribe("s1").await.unwrap();

        let agent_loop = AgentLoop::new(
            Arc::clone(&bus),
            Arc::new(ScriptedAgent::echo()),
            launch(SessionMode::Interactive, None),
            test_config(),
        );
        let running = tokio::spawn(agent_loop.run());

        // Wait for ready before sending.
        loop {
            if observer.recv().await.unwrap().message == ChannelMessage::Ready {
                break;
            }
        }
        bus.publish("s1", Envelope::user_message("a")).await.unwrap();
        bus.publish("s1", Envelope::user_message("b")).await.unwrap();

        let mut echoes = Vec::new();
        while echoes.len() < 2 {
            let envelope = tokio::time::timeout(Duration::from_secs(2), observer.recv())
                .await
                .unwrap()
                .unwrap();
            if let ChannelMessage::AssistantMessage { content } = envelope.message {
                echoes.push(content);
            }
        }
        assert_eq!(echoes, vec!["echo: a", "echo: b"]);

        // Channel teardown ends the loop.
        bus.close();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_interactive_step_error_reported_once_then_teardown() {
        let bus = Arc::new(MemoryBus::new());
        let mut observer = bus.subscribe("s1").await.unwrap();

        let agent_loop = AgentLoop::new(
            Arc::clone(&bus),
            Arc::new(FailingAgent),
            launch(SessionMode::Interactive, None),
            test_config(),
        );
        let running = tokio::spawn(agent_loop.run());

        loop {
            if observer.recv().await.unwrap().message == ChannelMessage::Ready {
                break;
            }
        }
        bus.publish("s1", Envelope::user_message("boom")).await.unwrap();

        let frames = collect_until_terminal(&mut observer).await;
        let errors = frames
            .iter()
            .filter(|m| matches!(m, ChannelMessage::Error { .. }))
            .count();
        assert_eq!(errors, 1);
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_heartbeats_published_while_running() {
        let bus = Arc::new(MemoryBus::new());
        let mut observer = bus.subscribe("s1").await.unwrap();

        let agent_loop = AgentLoop::new(
            Arc::clone(&bus),
            Arc::new(ScriptedAgent::echo()),
            launch(SessionMode::Interactive, None),
            AgentLoopConfig {
                heartbeat_interval: Duration::from_millis(30),
            },
        );
        let running = tokio::spawn(agent_loop.run());

        let mut saw_heartbeat = false;
        for _ in 0..10 {
            let envelope = tokio::time::timeout(Duration::from_secs(2), observer.recv())
                .await
                .unwrap()
                .unwrap();
            if envelope.message == ChannelMessage::Heartbeat {
                saw_heartbeat = true;
                break;
            }
        }
        assert!(saw_heartbeat);

        bus.close();
        running.await.unwrap().unwrap();
    }
}
