//! Per-conversation session tracking with cooperative cancellation.
//!
//! Every loop execution gets a [`Session`] holding a `CancellationToken`.
//! Starting a session cancels the other running sessions of the same
//! conversation, so only the newest loop keeps making progress.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Cancelled,
    Finished,
}

#[derive(Debug)]
pub struct Session {
    id: String,
    conversation_id: String,
    token: CancellationToken,
    finished: AtomicBool,
}

impl Session {
    fn new(conversation_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            token: CancellationToken::new(),
            finished: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn state(&self) -> SessionState {
        if self.finished.load(Ordering::SeqCst) {
            SessionState::Finished
        } else if self.token.is_cancelled() {
            SessionState::Cancelled
        } else {
            SessionState::Running
        }
    }

    pub fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }
}

/// Marks its session finished when dropped, whatever way the loop exits.
pub struct SessionGuard(Arc<Session>);

impl SessionGuard {
    pub fn new(session: Arc<Session>) -> Self {
        Self(session)
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.0
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.finish();
    }
}

/// Registry of live sessions keyed by conversation.
///
/// Clone is cheap (Arc-based).
#[derive(Clone, Default)]
pub struct SessionController {
    sessions: Arc<RwLock<HashMap<String, Vec<Arc<Session>>>>>,
}

impl SessionController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new running session, cancelling every other running session
    /// of `conversation_id`. Finished sessions are pruned first.
    pub async fn start(&self, conversation_id: &str) -> Arc<Session> {
        self.prune().await;

        let session = Arc::new(Session::new(conversation_id));
        let mut sessions = self.sessions.write().await;
        let entries = sessions.entry(conversation_id.to_string()).or_default();
        for stale in entries.iter() {
            if stale.state() == SessionState::Running {
                info!(
                    "cancelling session {} of {conversation_id}: superseded by {}",
                    stale.id, session.id
                );
                stale.token.cancel();
            }
        }
        entries.push(Arc::clone(&session));
        session
    }

    /// Drop finished sessions. Returns how many were removed.
    pub async fn prune(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let mut removed = 0;
        sessions.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|s| s.state() != SessionState::Finished);
            removed += before - entries.len();
            !entries.is_empty()
        });
        if removed > 0 {
            debug!("pruned {removed} finished session(s)");
        }
        removed
    }

    /// Cancel all running sessions of a conversation. Returns true if any was running.
    pub async fn cancel(&self, conversation_id: &str) -> bool {
        let sessions = self.sessions.read().await;
        let mut cancelled = false;
        for session in sessions.get(conversation_id).into_iter().flatten() {
            if session.state() == SessionState::Running {
                session.token.cancel();
                cancelled = true;
            }
        }
        cancelled
    }

    /// Cancel every running session, e.g. on shutdown.
    pub async fn cancel_all(&self) {
        let sessions = self.sessions.read().await;
        for session in sessions.values().flatten() {
            session.token.cancel();
        }
    }

    pub async fn states(&self, conversation_id: &str) -> Vec<SessionState> {
        let sessions = self.sessions.read().await;
        sessions
            .get(conversation_id)
            .map(|entries| entries.iter().map(|s| s.state()).collect())
            .unwrap_or_default()
    }

    pub async fn running_count(&self, conversation_id: &str) -> usize {
        self.states(conversation_id)
            .await
            .into_iter()
            .filter(|s| *s == SessionState::Running)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starting_cancels_previous_running_session() {
        let controller = SessionController::new();
        let first = controller.start("conv").await;
        let second = controller.start("conv").await;

        assert_eq!(first.state(), SessionState::Cancelled);
        assert_eq!(second.state(), SessionState::Running);
        assert_eq!(controller.running_count("conv").await, 1);
    }

    #[tokio::test]
    async fn other_conversations_are_untouched() {
        let controller = SessionController::new();
        let a = controller.start("a").await;
        let _b = controller.start("b").await;
        assert_eq!(a.state(), SessionState::Running);
    }

    #[tokio::test]
    async fn finished_sessions_are_pruned() {
        let controller = SessionController::new();
        let first = controller.start("conv").await;
        {
            let _guard = SessionGuard::new(Arc::clone(&first));
        }
        assert_eq!(first.state(), SessionState::Finished);
        assert_eq!(controller.prune().await, 1);
        assert!(controller.states("conv").await.is_empty());
    }

    #[tokio::test]
    async fn finished_session_is_not_cancelled_again() {
        let controller = SessionController::new();
        let first = controller.start("conv").await;
        first.finish();
        let _second = controller.start("conv").await;
        assert!(!first.token().is_cancelled());
        assert_eq!(controller.states("conv").await, vec![SessionState::Running]);
    }

    #[tokio::test]
    async fn explicit_cancel_reports_whether_anything_ran() {
        let controller = SessionController::new();
        assert!(!controller.cancel("conv").await);
        let session = controller.start("conv").await;
        assert!(controller.cancel("conv").await);
        assert!(session.token().is_cancelled());
    }
}
