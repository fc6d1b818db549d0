//! The agent step-function seam.

use async_trait::async_trait;
use futures::stream::BoxStream;
use sandbox_relay_core::ChannelMessage;
use serde_json::Value;
use thiserror::Error;

/// One unit of streamed agent output.
///
/// Each unit maps to exactly one outbound channel frame, republished in
/// emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutput {
    /// Text output.
    Assistant(String),
    /// Tool invocation.
    ToolUse { tool_name: String, tool_input: Value },
    /// Raw command output.
    CommandOutput(String),
}

impl From<AgentOutput> for ChannelMessage {
    fn from(output: AgentOutput) -> Self {
        match output {
            AgentOutput::Assistant(content) => Self::AssistantMessage { content },
            AgentOutput::ToolUse { tool_name, tool_input } => Self::ToolUse { tool_name, tool_input },
            AgentOutput::CommandOutput(text) => Self::CommandOutput { text },
        }
    }
}

/// Step-function failure, reported once on the channel as an `error` frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct StepError(pub String);

/// An agent's step function.
///
/// One call handles one input (an inbound message, or the launch task in
/// single-shot mode) and streams output units in the order they should be
/// republished. A mid-stream `Err` aborts the step.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn step(&self, input: &str) -> BoxStream<'static, Result<AgentOutput, StepError>>;
}
