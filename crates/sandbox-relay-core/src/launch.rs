//! Launch configuration handed to a sandbox at process start.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::SessionId;

/// Environment variable carrying the encoded launch configuration.
pub const LAUNCH_ENV_VAR: &str = "SANDBOX_RELAY_LAUNCH";

/// How a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Open-ended message loop until explicit disconnect.
    Interactive,
    /// One task to completion, then process exit.
    SingleShot,
}

/// Launch configuration error.
#[derive(Debug, Error)]
pub enum LaunchConfigError {
    #[error("Environment variable {LAUNCH_ENV_VAR} not set")]
    Missing,
    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Invalid launch config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Single-shot launch requires a task")]
    MissingTask,
}

/// The structured blob a sandbox process reads at startup.
///
/// The broker serializes this to JSON, base64-encodes it, and injects it
/// into the sandbox environment as [`LAUNCH_ENV_VAR`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Session mode.
    pub mode: SessionMode,
    /// Session identifier; doubles as the channel name.
    pub session_id: SessionId,
    /// Verified identity of the caller that started the session.
    pub caller_identity: String,
    /// Endpoint of the message bus the agent should attach to.
    pub channel_endpoint: String,
    /// Credential for the bus connection.
    pub channel_credential: String,
    /// Literal task payload; required in single-shot mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
}

impl LaunchConfig {
    /// Check mode/task consistency.
    ///
    /// # Errors
    /// Returns `MissingTask` for a single-shot config without a task.
    pub fn validate(&self) -> Result<(), LaunchConfigError> {
        if self.mode == SessionMode::SingleShot
            && self.task.as_ref().is_none_or(|t| t.is_empty())
        {
            return Err(LaunchConfigError::MissingTask);
        }
        Ok(())
    }

    /// Encode as a base64 JSON blob suitable for an environment variable.
    ///
    /// # Errors
    /// Returns error if JSON serialization fails.
    pub fn to_env_value(&self) -> Result<String, LaunchConfigError> {
        Ok(BASE64.encode(serde_json::to_vec(self)?))
    }

    /// Decode from the base64 JSON blob produced by [`Self::to_env_value`].
    ///
    /// # Errors
    /// Returns error if the blob is not valid base64 or JSON, or if a
    /// single-shot config carries no task.
    pub fn from_env_value(value: &str) -> Result<Self, LaunchConfigError> {
        let config: Self = serde_json::from_slice(&BASE64.decode(value)?)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and decode from the process environment.
    ///
    /// # Errors
    /// Returns `Missing` if [`LAUNCH_ENV_VAR`] is unset, otherwise as
    /// [`Self::from_env_value`].
    pub fn from_env() -> Result<Self, LaunchConfigError> {
        let value = std::env::var(LAUNCH_ENV_VAR).map_err(|_| LaunchConfigError::Missing)?;
        Self::from_env_value(&value)
    }
}
