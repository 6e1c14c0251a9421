//! Single source of truth for the cached session record.

use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::record::{SessionRecord, SESSION_SCHEMA_VERSION};
use crate::storage::KeyValueStore;

const SESSION_KEY: &str = "session:record";

/// Owns the session record and writes it through to the session-scoped
/// store. All mutation happens under one synchronous lock acquisition;
/// there is no await point between reading the old record and committing
/// the new one, so concurrent tasks cannot interleave a lost update.
pub struct SessionStore {
    scoped: Arc<dyn KeyValueStore>,
    cell: Mutex<Option<SessionRecord>>,
}

impl SessionStore {
    /// Hydrate from the scoped store. A record with a mismatched schema
    /// version reads as absent and its storage entry is dropped.
    pub fn new(scoped: Arc<dyn KeyValueStore>) -> Self {
        let cell = match scoped.get(SESSION_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<SessionRecord>(&raw) {
                Ok(record) if record.version == SESSION_SCHEMA_VERSION => Some(record),
                Ok(record) => {
                    debug!(
                        "discarding cached session with schema version {}",
                        record.version
                    );
                    let _ = scoped.remove(SESSION_KEY);
                    None
                }
                Err(err) => {
                    warn!("discarding undeserializable cached session: {err}");
                    let _ = scoped.remove(SESSION_KEY);
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!("cannot read cached session: {err}");
                None
            }
        };

        Self {
            scoped,
            cell: Mutex::new(cell),
        }
    }

    #[must_use]
    pub fn get(&self) -> Option<SessionRecord> {
        self.cell.lock().expect("session lock poisoned").clone()
    }

    /// Replace the record (or clear it with `None`) and persist before
    /// returning. Memory is authoritative; a persistence failure is logged
    /// but does not roll back the in-memory state.
    pub fn set(&self, record: Option<SessionRecord>) {
        let mut cell = self.cell.lock().expect("session lock poisoned");
        self.persist(record.as_ref());
        *cell = record;
    }

    /// Read-modify-write under the lock, for callers that must decide the
    /// new record from the old one without racing other writers.
    pub fn update(&self, f: impl FnOnce(Option<SessionRecord>) -> Option<SessionRecord>) {
        let mut cell = self.cell.lock().expect("session lock poisoned");
        let next = f(cell.take());
        self.persist(next.as_ref());
        *cell = next;
    }

    fn persist(&self, record: Option<&SessionRecord>) {
        let result = match record {
            Some(record) => match serde_json::to_string(record) {
                Ok(raw) => self.scoped.put(SESSION_KEY, &raw),
                Err(err) => {
                    warn!("cannot serialize session record: {err}");
                    return;
                }
            },
            None => self.scoped.remove(SESSION_KEY),
        };
        if let Err(err) = result {
            warn!("cannot persist session record: {err}");
        }
    }
}
