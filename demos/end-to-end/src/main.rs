//! End-to-end demo: one process hosting the bus, the broker, an in-process
//! agent, and a channel client.
//!
//! Run with: cargo run -p end-to-end-demo

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use sandbox_relay_agent::{AgentLoop, AgentLoopConfig, AgentOutput, ScriptedAgent};
use sandbox_relay_broker::{
    BrokerConfig, SandboxDriver, SandboxError, SessionBroker, StartRequest, StaticTokenVerifier,
};
use sandbox_relay_bus::MemoryBus;
use sandbox_relay_client::{ChannelClient, ClientConfig, ClientEvent};
use sandbox_relay_core::{ChannelMessage, LaunchConfig, SessionMode};
use tokio::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Driver that runs each "sandbox" as a task in this process.
struct InProcessDriver {
    bus: Arc<MemoryBus>,
    agents: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
}

#[async_trait]
impl SandboxDriver for InProcessDriver {
    async fn provision(&self, _session_id: &str) -> Result<(), SandboxError> {
        Ok(())
    }

    async fn inject_payload(&self, _session_id: &str, _payload: &[u8]) -> Result<(), SandboxError> {
        Ok(())
    }

    async fn launch(&self, session_id: &str, config: &LaunchConfig) -> Result<String, SandboxError> {
        config.validate()?;
        let agent = ScriptedAgent::new(vec![AgentOutput::ToolUse {
            tool_name: "todo".into(),
            tool_input: serde_json::json!({ "action": "list" }),
        }]);
        let agent_loop = AgentLoop::new(
            Arc::clone(&self.bus),
            Arc::new(agent),
            config.clone(),
            AgentLoopConfig::default(),
        );
        let handle = tokio::spawn(async move {
            if let Err(e) = agent_loop.run().await {
                tracing::error!("agent loop failed: {e}");
            }
        });
        self.agents.lock().await.insert(session_id.to_string(), handle);
        Ok(format!("proc-{session_id}"))
    }

    async fn touch(&self, _session_id: &str) -> Result<(), SandboxError> {
        Ok(())
    }

    async fn destroy(&self, session_id: &str) -> Result<(), SandboxError> {
        if let Some(handle) = self.agents.lock().await.remove(session_id) {
            handle.abort();
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let bus = Arc::new(MemoryBus::new());
    let driver = Arc::new(InProcessDriver {
        bus: Arc::clone(&bus),
        agents: Mutex::new(HashMap::new()),
    });
    let broker = SessionBroker::new(
        StaticTokenVerifier::new("demo-token", "demo@example.com"),
        driver,
        Arc::clone(&bus),
        BrokerConfig::default(),
    );

    // Client connects first so the ready frame is not missed.
    let mut client = ChannelClient::new(Arc::clone(&bus), ClientConfig::default());
    let connecting = tokio::spawn(async move {
        let result = client.connect("demo-session").await;
        (client, result)
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let response = broker
        .start_session(
            StartRequest {
                session_id: "demo-session".into(),
                mode: SessionMode::Interactive,
                task: None,
                payload: None,
            },
            Some("demo-token"),
        )
        .await?;
    tracing::info!(
        "session started on channel {} (pid {})",
        response.channel_name,
        response.process_id
    );

    let (mut client, connected) = connecting.await?;
    connected?;

    client.send("add milk to todos").await?;

    // Expect the echo plus the scripted tool call.
    for _ in 0..2 {
        match client.next_event().await {
            Some(ClientEvent::Message(envelope)) => match envelope.message {
                ChannelMessage::AssistantMessage { content } => {
                    tracing::info!("assistant: {content}");
                }
                ChannelMessage::ToolUse { tool_name, tool_input } => {
                    tracing::info!("tool use: {tool_name} {tool_input}");
                }
                other => tracing::info!("frame: {other:?}"),
            },
            other => {
                tracing::warn!("unexpected event: {other:?}");
                break;
            }
        }
    }

    client.disconnect();
    broker.stop_session("demo-session", Some("demo-token")).await?;
    tracing::info!("session stopped");
    Ok(())
}
