//! Canned agent for tests and demos.

use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};

use crate::agent::{Agent, AgentOutput, StepError};

/// Agent that replays a fixed script of output units for every input,
/// prefixed with an echo of the input itself.
pub struct ScriptedAgent {
    script: Vec<AgentOutput>,
}

impl ScriptedAgent {
    /// Agent that echoes each input as a single assistant message.
    #[must_use]
    pub const fn echo() -> Self {
        Self { script: Vec::new() }
    }

    /// Agent that echoes the input, then replays `script` in order.
    #[must_use]
    pub const fn new(script: Vec<AgentOutput>) -> Self {
        Self { script }
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn step(&self, input: &str) -> BoxStream<'static, Result<AgentOutput, StepError>> {
        let mut outputs = vec![AgentOutput::Assistant(format!("echo: {input}"))];
        outputs.extend(self.script.iter().cloned());
        futures::stream::iter(outputs.into_iter().map(Ok)).boxed()
    }
}
