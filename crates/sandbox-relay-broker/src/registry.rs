//! Synchronized session table.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use sandbox_relay_core::SessionMode;

/// One live session owned by the broker.
pub struct SessionEntry {
    /// Process identifier reported at launch.
    pub process_id: String,
    /// Session mode.
    pub mode: SessionMode,
    /// Inactivity supervisor task, single-shot sessions only.
    pub supervisor: Option<tokio::task::JoinHandle<()>>,
    /// Destroy-once guard shared with the supervisor, so a periodic-check
    /// teardown and an explicit stop cannot both destroy the sandbox.
    pub destroyed: Arc<AtomicBool>,
}

impl SessionEntry {
    /// Claim the right to destroy; the first caller wins.
    #[must_use]
    pub fn claim_destroy(&self) -> bool {
        !self.destroyed.swap(true, Ordering::SeqCst)
    }
}

/// Session table keyed by session id.
///
/// Owned by the broker and shared with supervisor tasks; entries carry no
/// references to other sessions' state.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, returning the one it replaced, if any.
    pub fn insert(&self, session_id: impl Into<String>, entry: SessionEntry) -> Option<SessionEntry> {
        self.inner.lock().unwrap().insert(session_id.into(), entry)
    }

    /// Remove and return an entry.
    pub fn remove(&self, session_id: &str) -> Option<SessionEntry> {
        self.inner.lock().unwrap().remove(session_id)
    }

    /// Remove the entry only if it still carries `destroyed` as its guard.
    ///
    /// A supervisor cleaning up after itself must not take out a fresh
    /// entry inserted by a concurrent restart of the same session id.
    pub fn remove_guarded(
        &self,
        session_id: &str,
        destroyed: &Arc<AtomicBool>,
    ) -> Option<SessionEntry> {
        let mut inner = self.inner.lock().unwrap();
        match inner.get(session_id) {
            Some(entry) if Arc::ptr_eq(&entry.destroyed, destroyed) => inner.remove(session_id),
            _ => None,
        }
    }

    /// Whether a session is registered.
    #[must_use]
    pub fn contains(&self, session_id: &str) -> bool {
        self.inner.lock().unwrap().contains_key(session_id)
    }

    /// Process id for a session, if registered.
    #[must_use]
    pub fn process_id(&self, session_id: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .get(session_id)
            .map(|entry| entry.process_id.clone())
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Whether no sessions are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
