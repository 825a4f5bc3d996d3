use std::{
    collections::{hash_map::Entry, HashMap},
    net::SocketAddr,
};

use parking_lot::Mutex;

use crate::session::{SessionHandle, SessionId};

/// The set of live sessions, shared between the acceptor (adds), the
/// sessions themselves (removes) and the close path (drain).
///
/// Dropping a handle, whether through `remove`, `clear` or the registry
/// itself going away, closes the shutdown channel of its session.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// returns false, and leaves the registry untouched, if the id is already present
    pub fn add(&self, id: SessionId, handle: SessionHandle) -> bool {
        match self.sessions.lock().entry(id) {
            Entry::Occupied(_) => {
                tracing::warn!("session {id} is already registered");
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(handle);
                true
            }
        }
    }

    /// no-op returning false when the session isn't there
    pub fn remove(&self, id: SessionId) -> bool {
        let removed = self.sessions.lock().remove(&id);
        removed.is_some()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// copy of the current members, ordered by id
    pub fn snapshot(&self) -> Vec<(SessionId, SocketAddr)> {
        let mut members: Vec<_> = self
            .sessions
            .lock()
            .iter()
            .map(|(id, handle)| (*id, handle.peer()))
            .collect();
        members.sort_unstable();
        members
    }

    /// take every member out in one go
    pub fn drain(&self) -> Vec<(SessionId, SessionHandle)> {
        self.sessions.lock().drain().collect()
    }

    pub fn clear(&self) {
        // handles are dropped once the lock is released
        let _ = self.drain();
    }
}
