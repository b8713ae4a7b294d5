//! Session registry: the authoritative map of live sessions.
//!
//! All mutation goes through one lock. Fan-out paths (heartbeat sweeps,
//! broadcast, shutdown) iterate over a [`snapshot`](SessionRegistry::snapshot)
//! so no lock is held across I/O.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use warden_core::protocol::SessionId;

use crate::session::ClientSession;

/// Concurrent map of session id → session.
///
/// A session id appears here from the moment `add` returns true until
/// `remove` is called for it; removing an absent id is a no-op, which gives
/// callers exactly-once cleanup semantics for free.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Arc<ClientSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry::default()
    }

    /// Insert a session. Returns false if the id is already present.
    pub async fn add(&self, session: Arc<ClientSession>) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.entry(session.id().clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(session);
                true
            }
        }
    }

    /// Remove a session, returning it if it was present.
    pub async fn remove(&self, id: &SessionId) -> Option<Arc<ClientSession>> {
        let removed = self.sessions.lock().await.remove(id);
        if removed.is_some() {
            debug!(%id, "session removed from registry");
        }
        removed
    }

    pub async fn get(&self, id: &SessionId) -> Option<Arc<ClientSession>> {
        self.sessions.lock().await.get(id).cloned()
    }

    /// Point-in-time copy of all current sessions, in no defined order.
    pub async fn snapshot(&self) -> Vec<Arc<ClientSession>> {
        self.sessions.lock().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Drain every session, returning the drained set.
    pub async fn clear(&self) -> Vec<Arc<ClientSession>> {
        let mut sessions = self.sessions.lock().await;
        sessions.drain().map(|(_, session)| session).collect()
    }
}
