//! Registry of live client sessions, and the fan-out path for new records.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::record::BinaryRecord;
use crate::session::Session;

struct Sessions {
    by_id: HashMap<u64, Arc<Session>>,
    /// Point-in-time copy handed to broadcasters; rebuilt when `dirty`.
    snapshot: Arc<Vec<Arc<Session>>>,
    dirty: bool,
}

struct RegistryInner {
    next_id: AtomicU64,
    sessions: Mutex<Sessions>,
}

/// Thread-safe session registry. Clone is cheap (Arc).
#[derive(Clone)]
pub(crate) struct ConnectionRegistry(Arc<RegistryInner>);

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self(Arc::new(RegistryInner {
            next_id: AtomicU64::new(1),
            sessions: Mutex::new(Sessions {
                by_id: HashMap::new(),
                snapshot: Arc::new(Vec::new()),
                dirty: false,
            }),
        }))
    }

    /// Allocate a session id. Ids are never reused.
    pub fn next_id(&self) -> u64 {
        self.0.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register `session` unless `max_connections` are already open.
    ///
    /// Returns `false` (and registers nothing) at capacity.
    pub fn try_register(&self, session: Arc<Session>, max_connections: usize) -> bool {
        let mut sessions = self.0.sessions.lock().unwrap();
        if sessions.by_id.len() >= max_connections {
            return false;
        }
        sessions.by_id.insert(session.id(), session);
        sessions.dirty = true;
        true
    }

    /// Remove a session. Unknown ids are ignored.
    pub fn remove(&self, id: u64) {
        let mut sessions = self.0.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        if sessions.by_id.remove(&id).is_some() {
            sessions.dirty = true;
            debug!(session = id, remaining = sessions.by_id.len(), "session removed");
        }
    }

    /// Current sessions, rebuilding the cached snapshot if it is stale.
    fn snapshot(&self) -> Arc<Vec<Arc<Session>>> {
        let mut sessions = self.0.sessions.lock().unwrap();
        if sessions.dirty {
            sessions.snapshot = Arc::new(sessions.by_id.values().cloned().collect());
            sessions.dirty = false;
        }
        sessions.snapshot.clone()
    }

    /// Offer a record to every registered session. Never waits on delivery.
    pub fn broadcast(&self, record: &Arc<BinaryRecord>) {
        for session in self.snapshot().iter() {
            session.offer(record);
        }
    }

    /// Close every registered session.
    pub fn close_all(&self) {
        let sessions = self.snapshot();
        debug!(count = sessions.len(), "closing all sessions");
        for session in sessions.iter() {
            session.close();
        }
    }

    pub fn count(&self) -> usize {
        self.0.sessions.lock().unwrap().by_id.len()
    }
}
