//! Session registry
//!
//! One [`ClientSession`] per server id, created on demand and removed on
//! disposal.

use crate::lsp::launch::LaunchSpec;
use crate::lsp::session::{ClientSession, SessionEnv, SessionState, SessionStatus};
use crate::sync::SyncPolicy;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Extra time `dispose` allows beyond the session's grace period
const DISPOSE_MARGIN: Duration = Duration::from_secs(1);

/// Map from server id to its session. The lock is never held across an await.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, ClientSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ClientSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The existing session for `id`, unless it has failed or stopped, in
    /// which case a fresh `Idle` session takes its place.
    pub fn get_or_create(
        &self,
        id: &str,
        spec: LaunchSpec,
        policy: SyncPolicy,
        env: SessionEnv,
    ) -> ClientSession {
        let mut sessions = self.lock();

        if let Some(session) = sessions.get(id) {
            if !session.state().is_terminal() {
                debug!("Reusing session {}", id);
                return session.clone();
            }
            info!("Replacing {} session {}", session.state(), id);
        }

        let session = ClientSession::new(id, spec, policy, env);
        sessions.insert(id.to_string(), session.clone());
        session
    }

    pub fn get(&self, id: &str) -> Option<ClientSession> {
        self.lock().get(id).cloned()
    }

    /// A live session whose document selector includes `language_id`.
    pub fn session_for_language(&self, language_id: &str) -> Option<ClientSession> {
        let sessions = self.lock();
        let mut candidates: Vec<&ClientSession> = sessions
            .values()
            .filter(|s| !s.state().is_terminal() && s.policy().handles_language(language_id))
            .collect();
        candidates.sort_by(|a, b| a.id().cmp(b.id()));
        candidates.first().map(|s| (*s).clone())
    }

    /// Remove `id` and stop its session. The entry is gone even if the
    /// stop does not finish in time. Returns whether the id was present.
    pub async fn dispose(&self, id: &str) -> bool {
        let Some(session) = self.lock().remove(id) else {
            return false;
        };
        stop_and_wait(session).await;
        true
    }

    /// Stop `session` and remove its entry, but only if the registry still
    /// maps its id to this very session. Returns whether the entry was removed.
    pub async fn dispose_session(&self, session: &ClientSession) -> bool {
        let removed = {
            let mut sessions = self.lock();
            match sessions.get(session.id()) {
                Some(current) if current.same_session(session) => {
                    sessions.remove(session.id());
                    true
                }
                _ => false,
            }
        };
        if !removed {
            debug!("Session {} was already replaced", session.id());
        }
        stop_and_wait(session.clone()).await;
        removed
    }

    /// Dispose every session concurrently.
    pub async fn dispose_all(&self) {
        let sessions: Vec<ClientSession> = self.lock().drain().map(|(_, s)| s).collect();
        if sessions.is_empty() {
            return;
        }
        info!("Disposing {} sessions", sessions.len());
        join_all(sessions.into_iter().map(stop_and_wait)).await;
    }

    /// Snapshot of every session, ordered by id.
    pub fn status(&self) -> Vec<(String, SessionStatus)> {
        let mut status: Vec<(String, SessionStatus)> = self
            .lock()
            .iter()
            .map(|(id, session)| (id.clone(), session.status()))
            .collect();
        status.sort_by(|a, b| a.0.cmp(&b.0));
        status
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

async fn stop_and_wait(session: ClientSession) {
    session.stop();
    let limit = session.options().grace_period + DISPOSE_MARGIN;
    let stopped = session.wait_for(|s| s.state == SessionState::Stopped);
    match tokio::time::timeout(limit, stopped).await {
        Ok(_) => debug!("Session {} disposed", session.id()),
        Err(_) => warn!(
            "Session {} did not stop within {:?}",
            session.id(),
            limit
        ),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::ConfigHandle;
    use crate::lsp::session::SessionOptions;
    use crate::lsp::transport::TracingSink;
    use crate::sync::EventWatcher;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    const WAIT: Duration = Duration::from_secs(10);

    fn env(root: &Path) -> SessionEnv {
        SessionEnv {
            config: ConfigHandle::default(),
            install_dir: root.to_path_buf(),
            workspace_root: root.to_path_buf(),
            watcher: Arc::new(EventWatcher::new(root)),
            diagnostics: Arc::new(TracingSink),
            options: SessionOptions {
                grace_period: Duration::from_millis(500),
                debounce: Duration::from_millis(50),
            },
        }
    }

    fn policy(language: &str) -> SyncPolicy {
        SyncPolicy::new([language], language, vec!["**/*.dws".to_string()]).unwrap()
    }

    fn counting_cat(counter: &Path) -> LaunchSpec {
        LaunchSpec::DirectExecutable {
            path: PathBuf::from("sh"),
            args: vec![
                "-c".to_string(),
                format!("echo x >> '{}'; exec cat", counter.display()),
            ],
        }
    }

    fn process_alive(pid: u32) -> bool {
        std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_shared_session_spawns_one_process() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("spawns");
        let registry = SessionRegistry::new();

        let first = registry.get_or_create("dws", counting_cat(&counter), policy("dws"), env(dir.path()));
        first.start();
        let second = registry.get_or_create("dws", counting_cat(&counter), policy("dws"), env(dir.path()));
        second.start();

        let status = tokio::time::timeout(WAIT, second.wait_settled()).await.unwrap();
        assert_eq!(status.state, SessionState::Running);
        assert_eq!(registry.len(), 1);
        let pid = status.pid.unwrap();
        assert!(process_alive(pid));

        assert!(registry.dispose("dws").await);
        assert!(registry.is_empty());
        assert_eq!(first.state(), SessionState::Stopped);
        assert!(!process_alive(pid));
        assert_eq!(std::fs::read_to_string(&counter).unwrap(), "x\n");

        assert!(!registry.dispose("dws").await);
    }

    #[tokio::test]
    async fn test_failed_session_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new();
        let missing = LaunchSpec::DirectExecutable {
            path: PathBuf::from("/definitely/not/a/server"),
            args: vec![],
        };

        let failed = registry.get_or_create("dws", missing.clone(), policy("dws"), env(dir.path()));
        failed.start();
        let status = tokio::time::timeout(WAIT, failed.wait_settled()).await.unwrap();
        assert_eq!(status.state, SessionState::Failed);
        assert!(registry.session_for_language("dws").is_none());

        let fresh = registry.get_or_create("dws", missing, policy("dws"), env(dir.path()));
        assert_eq!(fresh.state(), SessionState::Idle);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.status()[0].1.state, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_dispose_session_leaves_replacement_alone() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new();
        let missing = LaunchSpec::DirectExecutable {
            path: PathBuf::from("/definitely/not/a/server"),
            args: vec![],
        };
        let cat = LaunchSpec::DirectExecutable {
            path: PathBuf::from("cat"),
            args: vec![],
        };

        let failed = registry.get_or_create("dws", missing, policy("dws"), env(dir.path()));
        failed.start();
        tokio::time::timeout(WAIT, failed.wait_settled()).await.unwrap();

        let retry = registry.get_or_create("dws", cat, policy("dws"), env(dir.path()));
        retry.start();
        let status = tokio::time::timeout(WAIT, retry.wait_settled()).await.unwrap();
        assert_eq!(status.state, SessionState::Running);
        assert!(!retry.same_session(&failed));

        assert!(!registry.dispose_session(&failed).await);
        assert_eq!(failed.state(), SessionState::Stopped);
        assert_eq!(retry.state(), SessionState::Running);
        assert!(registry.get("dws").unwrap().same_session(&retry));

        assert!(registry.dispose_session(&retry).await);
        assert!(registry.is_empty());
        assert_eq!(retry.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_session_for_language_and_dispose_all() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new();
        let cat = LaunchSpec::DirectExecutable {
            path: PathBuf::from("cat"),
            args: vec![],
        };

        let dws = registry.get_or_create("dwsls", cat.clone(), policy("dws"), env(dir.path()));
        let dwscript = registry.get_or_create("dwsc", cat, policy("dwscript"), env(dir.path()));
        dws.start();
        dwscript.start();

        assert_eq!(registry.session_for_language("dws").unwrap().id(), "dwsls");
        assert_eq!(registry.session_for_language("dwscript").unwrap().id(), "dwsc");
        assert!(registry.session_for_language("pascal").is_none());

        let ids: Vec<String> = registry.status().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["dwsc".to_string(), "dwsls".to_string()]);

        registry.dispose_all().await;
        assert!(registry.is_empty());
        assert_eq!(dws.state(), SessionState::Stopped);
        assert_eq!(dwscript.state(), SessionState::Stopped);
    }
}
