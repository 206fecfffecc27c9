use std::collections::BTreeSet;

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::session::SessionHandle;

/// The server-local table of live sessions and the pool of free ids.
///
/// Ids are dense in `1..=capacity`. An admitted connection always takes
/// the smallest free id, and the id returns to the pool when the session
/// ends, so the live ids and the free ids partition the range at every
/// quiescent point.
#[derive(Default)]
pub(crate) struct Registry {
    tables: Mutex<Tables>,
}

#[derive(Default)]
struct Tables {
    sessions: AHashMap<usize, SessionHandle>,
    free_ids: BTreeSet<usize>,
}

impl Registry {
    /// refill the free-id pool for `capacity` slots and drop any stale
    /// entries left over from a previous run.
    pub fn reset(&self, capacity: usize) {
        let mut tables = self.tables.lock();
        tables.sessions.clear();
        tables.free_ids = (1..=capacity).collect();
    }

    /// empty both tables.
    pub fn clear(&self) {
        let mut tables = self.tables.lock();
        tables.sessions.clear();
        tables.free_ids.clear();
    }

    /// take the smallest free id, if any remains.
    pub fn allocate(&self) -> Option<usize> {
        self.tables.lock().free_ids.pop_first()
    }

    /// return an id to the pool without touching the session table.
    pub fn release(&self, id: usize) {
        self.tables.lock().free_ids.insert(id);
    }

    /// register the handle of a session that finished its handshake.
    pub fn insert(&self, id: usize, handle: SessionHandle) {
        self.tables.lock().sessions.insert(id, handle);
    }

    /// remove a finished session and recycle its id. Answers false for an
    /// id that is not registered, which makes teardown idempotent.
    pub fn discard(&self, id: usize) -> bool {
        let mut tables = self.tables.lock();
        if tables.sessions.remove(&id).is_some() {
            tables.free_ids.insert(id);
            true
        } else {
            false
        }
    }

    pub fn get(&self, id: usize) -> Option<SessionHandle> {
        self.tables.lock().sessions.get(&id).cloned()
    }

    /// snapshot of every live session handle.
    pub fn handles(&self) -> Vec<SessionHandle> {
        self.tables.lock().sessions.values().cloned().collect()
    }
}
