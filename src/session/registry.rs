//! Session lookup shared by the I/O layer and the inference worker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::session::session::Session;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<Session>) {
        self.sessions
            .lock()
            .expect("registry lock poisoned")
            .insert(session.id.clone(), session);
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .expect("registry lock poisoned")
            .remove(id)
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .expect("registry lock poisoned")
            .get(id)
            .cloned()
    }

    /// Clones the handles of every active session and releases the lock
    /// before the caller iterates — the worker must never run inference
    /// while holding the registry.
    pub fn snapshot_active(&self) -> Vec<Arc<Session>> {
        self.sessions
            .lock()
            .expect("registry lock poisoned")
            .values()
            .filter(|s| s.is_active())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empties the registry, returning every session. Shutdown path.
    pub fn drain_all(&self) -> Vec<Arc<Session>> {
        self.sessions
            .lock()
            .expect("registry lock poisoned")
            .drain()
            .map(|(_, s)| s)
            .collect()
    }
}
