//! Sandbox lifecycle seam and the local-process implementation.

use std::{collections::HashMap, path::PathBuf};

use async_trait::async_trait;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use sandbox_relay_core::{LaunchConfig, LaunchConfigError, launch::LAUNCH_ENV_VAR};
use thiserror::Error;
use tokio::sync::Mutex;

/// Sandbox error.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Sandbox not provisioned: {0}")]
    NotProvisioned(String),
    #[error("Agent executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("Invalid launch config: {0}")]
    Config(#[from] LaunchConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Owns sandbox instances keyed by session id.
///
/// Only the broker calls into this seam; clients never address a sandbox
/// directly.
#[async_trait]
pub trait SandboxDriver: Send + Sync {
    /// Find or create the sandbox for a session. Idempotent.
    async fn provision(&self, session_id: &str) -> Result<(), SandboxError>;

    /// Place the agent payload into the sandbox filesystem.
    async fn inject_payload(&self, session_id: &str, payload: &[u8]) -> Result<(), SandboxError>;

    /// Start (or restart) the agent process with the launch configuration,
    /// returning an opaque process identifier for observability.
    async fn launch(&self, session_id: &str, config: &LaunchConfig) -> Result<String, SandboxError>;

    /// Perform a no-op activity inside the sandbox to reset its idle-sleep
    /// timer. Best-effort; an asleep or missing sandbox is not an error.
    async fn touch(&self, session_id: &str) -> Result<(), SandboxError>;

    /// Tear the sandbox down. Idempotent: destroying a missing sandbox
    /// succeeds.
    async fn destroy(&self, session_id: &str) -> Result<(), SandboxError>;
}

struct ProcessSandbox {
    dir: PathBuf,
    child: Option<AsyncGroupChild>,
}

/// Driver that runs each agent as a local child process group, with a
/// per-session work directory standing in for the sandbox filesystem.
///
/// The launch configuration travels in the [`LAUNCH_ENV_VAR`] environment
/// variable as a base64 JSON blob.
pub struct ProcessDriver {
    root: PathBuf,
    executable: String,
    sandboxes: Mutex<HashMap<String, ProcessSandbox>>,
}

impl ProcessDriver {
    /// Driver rooted at `root`, launching `executable` (resolved via PATH).
    #[must_use]
    pub fn new(root: PathBuf, executable: impl Into<String>) -> Self {
        Self {
            root,
            executable: executable.into(),
            sandboxes: Mutex::new(HashMap::new()),
        }
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }
}

#[async_trait]
impl SandboxDriver for ProcessDriver {
    async fn provision(&self, session_id: &str) -> Result<(), SandboxError> {
        let mut sandboxes = self.sandboxes.lock().await;
        if sandboxes.contains_key(session_id) {
            return Ok(());
        }
        let dir = self.session_dir(session_id);
        tokio::fs::create_dir_all(&dir).await?;
        sandboxes.insert(
            session_id.to_string(),
            ProcessSandbox { dir, child: None },
        );
        tracing::debug!("provisioned sandbox for session {session_id}");
        Ok(())
    }

    async fn inject_payload(&self, session_id: &str, payload: &[u8]) -> Result<(), SandboxError> {
        let sandboxes = self.sandboxes.lock().await;
        let sandbox = sandboxes
            .get(session_id)
            .ok_or_else(|| SandboxError::NotProvisioned(session_id.to_string()))?;
        tokio::fs::write(sandbox.dir.join("agent-payload"), payload).await?;
        Ok(())
    }

    async fn launch(&self, session_id: &str, config: &LaunchConfig) -> Result<String, SandboxError> {
        config.validate()?;
        let executable = which::which(&self.executable)
            .map_err(|_| SandboxError::ExecutableNotFound(self.executable.clone()))?;

        let mut sandboxes = self.sandboxes.lock().await;
        let sandbox = sandboxes
            .get_mut(session_id)
            .ok_or_else(|| SandboxError::NotProvisioned(session_id.to_string()))?;

        // Restart semantics: a second launch replaces the running process.
        if let Some(mut previous) = sandbox.child.take() {
            let _ = previous.kill().await;
        }

        let child = tokio::process::Command::new(executable)
            .current_dir(&sandbox.dir)
            .env(LAUNCH_ENV_VAR, config.to_env_value()?)
            .group_spawn()?;
        let process_id = child
            .id()
            .map_or_else(|| uuid::Uuid::new_v4().to_string(), |pid| pid.to_string());
        sandbox.child = Some(child);

        tracing::info!("launched agent for session {session_id} (pid {process_id})");
        Ok(process_id)
    }

    async fn touch(&self, session_id: &str) -> Result<(), SandboxError> {
        let sandboxes = self.sandboxes.lock().await;
        let Some(sandbox) = sandboxes.get(session_id) else {
            // Informational: the sandbox may already be asleep or gone.
            tracing::debug!("keepalive for unknown session {session_id}");
            return Ok(());
        };
        let stamp = sandbox_relay_core::now_millis().to_string();
        if let Err(e) = tokio::fs::write(sandbox.dir.join(".keepalive"), stamp).await {
            tracing::debug!("keepalive touch failed for {session_id}: {e}");
        }
        Ok(())
    }

    async fn destroy(&self, session_id: &str) -> Result<(), SandboxError> {
        let removed = self.sandboxes.lock().await.remove(session_id);
        let Some(mut sandbox) = removed else {
            return Ok(());
        };
        if let Some(mut child) = sandbox.child.take() {
            if let Err(e) = child.kill().await {
                tracing::debug!("kill for session {session_id} failed: {e}");
            }
        }
        if let Err(e) = tokio::fs::remove_dir_all(&sandbox.dir).await {
            tracing::debug!("cleanup of {} failed: {e}", sandbox.dir.display());
        }
        tracing::info!("destroyed sandbox for session {session_id}");
        Ok(())
    }
}
