use tokio::sync::watch;
use tracing::debug;

use crate::transport::{SessionHandle, SessionId};

/// Single-slot holder for the session that receives upstream traffic.
///
/// The slot is last-writer-wins: a new session replaces the previous one
/// without closing or notifying it. A session that disconnects stays in the
/// slot until something replaces it, and sends to it then fail as a no-op.
pub struct SessionRegistry {
    current: watch::Sender<Option<SessionHandle>>,
    changes: watch::Sender<Option<SessionId>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (current, _) = watch::channel(None);
        let (changes, _) = watch::channel(None);
        Self { current, changes }
    }

    /// Replace the current session, returning the one it displaced.
    pub fn set_current(&self, session: SessionHandle) -> Option<SessionHandle> {
        let id = session.id();
        let previous = self.current.send_replace(Some(session));
        if let Some(prev) = &previous {
            debug!("Session {} superseded by {}", prev.id(), id);
        }
        self.changes.send_replace(Some(id));
        previous
    }

    pub fn current(&self) -> Option<SessionHandle> {
        self.current.borrow().clone()
    }

    pub fn clear(&self) -> Option<SessionHandle> {
        let previous = self.current.send_replace(None);
        self.changes.send_replace(None);
        previous
    }

    /// Watch the current session id. `None` after a clear.
    pub fn subscribe(&self) -> watch::Receiver<Option<SessionId>> {
        self.changes.subscribe()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
