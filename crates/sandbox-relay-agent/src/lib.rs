//! Sandbox-side agent loop.
//!
//! Provides:
//! - `Inbox` - FIFO bridge from the bus listener to the step function
//! - `Agent` - The step-function seam, emitting an ordered output stream
//! - `AgentLoop` - Subscribe, signal ready, drive the agent, tear down
//! - `ScriptedAgent` - Canned agent for tests and demos

pub mod agent;
pub mod inbox;
pub mod run;
pub mod script;

pub use agent::{Agent, AgentOutput, StepError};
pub use inbox::Inbox;
pub use run::{AgentError, AgentLoop, AgentLoopConfig};
pub use script::ScriptedAgent;
