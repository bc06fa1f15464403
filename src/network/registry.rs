//! Session registry
//!
//! Maps session identifiers to live connections. Accept, disconnect and
//! receive paths all mutate it concurrently, so every access goes through a
//! single mutex. The lock is never held across socket I/O: callers get
//! cloned handles out and work on those.

use std::collections::HashMap;
use tokio::sync::Mutex;

use super::ConnectionHandle;
use crate::protocol::SessionId;

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, ConnectionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Fails (returning false) if the identifier is
    /// already taken; the existing entry is left untouched.
    pub async fn insert(&self, id: SessionId, connection: ConnectionHandle) -> bool {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&id) {
            return false;
        }
        sessions.insert(id, connection);
        true
    }

    /// Allocate an identifier not currently registered
    pub async fn unused_id(&self) -> SessionId {
        let sessions = self.sessions.lock().await;
        loop {
            let id = SessionId::new_v4();
            if !id.is_nil() && !sessions.contains_key(&id) {
                return id;
            }
        }
    }

    pub async fn remove(&self, id: &SessionId) -> Option<ConnectionHandle> {
        self.sessions.lock().await.remove(id)
    }

    pub async fn get(&self, id: &SessionId) -> Option<ConnectionHandle> {
        self.sessions.lock().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &SessionId) -> bool {
        self.sessions.lock().await.contains_key(id)
    }

    pub async fn ids(&self) -> Vec<SessionId> {
        self.sessions.lock().await.keys().copied().collect()
    }

    /// Copy of every entry, for iterating without holding the lock
    pub async fn snapshot(&self) -> Vec<(SessionId, ConnectionHandle)> {
        self.sessions
            .lock()
            .await
            .iter()
            .map(|(id, conn)| (*id, conn.clone()))
            .collect()
    }

    /// Remove and return every entry
    pub async fn drain(&self) -> Vec<(SessionId, ConnectionHandle)> {
        self.sessions.lock().await.drain().collect()
    }

    /// Like [`drain`](Self::drain), but usable outside an async context.
    /// Returns nothing if the lock is currently held.
    pub fn try_drain(&self) -> Vec<(SessionId, ConnectionHandle)> {
        match self.sessions.try_lock() {
            Ok(mut sessions) => sessions.drain().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    pub async fn clear(&self) {
        self.sessions.lock().await.clear();
    }
}
