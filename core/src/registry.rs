//! Explicit session registry, owned by the process context.
//!
//! Each session sits behind its own lock. Holding the lock is what makes a
//! clock change, a regeneration, or a train transition one critical
//! section: interleaved requests for the same session are serialised here.

use crate::{
    error::{DispatchError, DispatchResult},
    session::SessionCoordinator,
    types::SessionId,
};
use parking_lot::Mutex;
use std::{collections::BTreeMap, sync::Arc};

pub type SharedSession = Arc<Mutex<SessionCoordinator>>;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: BTreeMap<SessionId, SharedSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of an opened session. Fails if the id is taken.
    pub fn insert(&mut self, session: SessionCoordinator) -> DispatchResult<SharedSession> {
        let id = session.session_id().to_string();
        if self.sessions.contains_key(&id) {
            return Err(DispatchError::Conflict { kind: "session", id });
        }
        let shared = Arc::new(Mutex::new(session));
        self.sessions.insert(id, Arc::clone(&shared));
        Ok(shared)
    }

    pub fn get(&self, session_id: &str) -> DispatchResult<SharedSession> {
        self.sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| DispatchError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    /// Run `f` with exclusive access to one session.
    pub fn with_session<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut SessionCoordinator) -> DispatchResult<T>,
    ) -> DispatchResult<T> {
        let shared = self.get(session_id)?;
        let mut guard = shared.lock();
        f(&mut guard)
    }

    pub fn remove(&mut self, session_id: &str) -> Option<SharedSession> {
        self.sessions.remove(session_id)
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
