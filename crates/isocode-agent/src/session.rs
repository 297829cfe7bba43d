//! Session state and the process-wide registry

use dashmap::DashMap;
use isocode_core::{Message, Mode, PendingDiff, SessionKey};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Everything the step loop mutates. All field mutation happens inside the
/// session's owning task; the mutex only guards against registry readers.
#[derive(Debug)]
pub struct SessionState {
    pub model: Option<String>,
    pub mode: Mode,
    pub workspace_root: PathBuf,
    pub messages: Vec<Message>,
    pub pending_diff: Option<PendingDiff>,
    pub retries: u32,
    pub plan: Option<String>,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub consecutive_finals: u32,
    pub consecutive_thoughts: u32,
    pub steps_without_action: u32,
    pub compactions: u32,
    pub delegation_disabled: bool,
    pub steps: u64,
}

impl SessionState {
    fn new(mode: Mode, workspace_root: PathBuf, model: Option<String>) -> Self {
        Self {
            model,
            mode,
            workspace_root,
            messages: Vec::new(),
            pending_diff: None,
            retries: 0,
            plan: None,
            total_tasks: 0,
            completed_tasks: 0,
            consecutive_finals: 0,
            consecutive_thoughts: 0,
            steps_without_action: 0,
            compactions: 0,
            delegation_disabled: false,
            steps: 0,
        }
    }
}

pub struct Session {
    pub key: SessionKey,
    pub state: Mutex<SessionState>,
    /// Set by the stop endpoint; the loop observes it between steps and at
    /// tool completion.
    stop_requested: AtomicBool,
}

impl Session {
    pub fn new(key: SessionKey, mode: Mode, workspace_root: PathBuf, model: Option<String>) -> Self {
        Self {
            key,
            state: Mutex::new(SessionState::new(mode, workspace_root, model)),
            stop_requested: AtomicBool::new(false),
        }
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub async fn message_count(&self) -> usize {
        self.state.lock().await.messages.len()
    }
}

/// Process-wide mapping from session identifier to session. Lookup, insert,
/// and delete are atomic; everything else happens under the session's own
/// lock.
pub struct SessionRegistry {
    sessions: DashMap<SessionKey, Arc<Session>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Get the existing session or create a fresh one. The caller seeds the
    /// system and first user message on a fresh session.
    pub fn open_or_get(
        &self,
        key: &SessionKey,
        mode: Mode,
        workspace_root: PathBuf,
        model: Option<String>,
    ) -> (Arc<Session>, bool) {
        let mut created = false;
        let session = self
            .sessions
            .entry(key.clone())
            .or_insert_with(|| {
                created = true;
                info!("session {} created ({:?})", key, mode);
                Arc::new(Session::new(key.clone(), mode, workspace_root, model))
            })
            .clone();
        (session, created)
    }

    pub fn get(&self, key: &SessionKey) -> Option<Arc<Session>> {
        self.sessions.get(key).map(|s| s.clone())
    }

    pub fn list(&self) -> Vec<SessionKey> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn remove(&self, key: &SessionKey) -> Option<Arc<Session>> {
        self.sessions.remove(key).map(|(_, s)| s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_or_get_returns_same_session() {
        let registry = SessionRegistry::new();
        let key = SessionKey::new("s1");
        let (a, created_a) =
            registry.open_or_get(&key, Mode::Agent, PathBuf::from("/tmp"), None);
        let (b, created_b) =
            registry.open_or_get(&key, Mode::Agent, PathBuf::from("/tmp"), None);
        assert!(created_a);
        assert!(!created_b);

        a.state.lock().await.messages.push(Message::user("hi"));
        assert_eq!(b.message_count().await, 1);
    }

    #[tokio::test]
    async fn remove_clears_registry() {
        let registry = SessionRegistry::new();
        let key = SessionKey::new("gone");
        registry.open_or_get(&key, Mode::AgentPlus, PathBuf::from("/tmp"), None);
        assert!(registry.remove(&key).is_some());
        assert!(registry.get(&key).is_none());
    }

    #[test]
    fn stop_flag() {
        let session = Session::new(
            SessionKey::new("s"),
            Mode::Agent,
            PathBuf::from("/tmp"),
            None,
        );
        assert!(!session.stop_requested());
        session.request_stop();
        assert!(session.stop_requested());
    }
}
