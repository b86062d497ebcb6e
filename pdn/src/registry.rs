use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;

use proto::SessionId;

use crate::session::Session;

/// Shared directory of live sessions, keyed by identity
///
/// Clones share the same map. Removing a session here only forgets the
/// handle; the driver keeps running until every other handle drops too.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<FxHashMap<SessionId, Session>>>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, returning any previous holder of the same id
    pub fn insert(&self, session: Session) -> Option<Session> {
        self.sessions
            .lock()
            .unwrap()
            .insert(session.id(), session)
    }

    /// Look up a session by id
    pub fn get(&self, id: SessionId) -> Option<Session> {
        self.sessions.lock().unwrap().get(&id).cloned()
    }

    /// Look up a session, creating and registering it if absent
    pub fn get_or_insert_with(&self, id: SessionId, make: impl FnOnce() -> Session) -> Session {
        self.sessions
            .lock()
            .unwrap()
            .entry(id)
            .or_insert_with(make)
            .clone()
    }

    /// Forget a session
    pub fn remove(&self, id: SessionId) -> Option<Session> {
        self.sessions.lock().unwrap().remove(&id)
    }

    /// Ids of every registered session
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.lock().unwrap().keys().copied().collect()
    }

    /// Number of registered sessions
    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Whether no sessions are registered
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().unwrap().is_empty()
    }
}
