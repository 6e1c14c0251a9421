//! Durable scoped storage used by the session core.
//!
//! Two instances are wired at composition time: a session-scoped store
//! holding the cached session record (process memory, so its contents die
//! with the process) and a longer-lived store holding rate-limit windows,
//! offline-identity hints, and the manual-logout flag.

pub mod file;

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Mutex;

pub use file::FileStore;

/// String key/value storage, synchronous from the caller's perspective.
///
/// `put` must be durable before it returns; callers rely on writes not
/// being dropped when the process navigates away immediately afterwards.
pub trait KeyValueStore: Send + Sync {
    /// # Errors
    /// Returns an error if the backing store cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// # Errors
    /// Returns an error if the value cannot be persisted.
    fn put(&self, key: &str, value: &str) -> Result<()>;

    /// # Errors
    /// Returns an error if the backing store cannot be updated.
    fn remove(&self, key: &str) -> Result<()>;
}

/// In-memory store scoped to the current process session.
///
/// Also serves as the storage double in unit tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    cells: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let cells = self.cells.lock().expect("storage lock poisoned");
        Ok(cells.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut cells = self.cells.lock().expect("storage lock poisoned");
        cells.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut cells = self.cells.lock().expect("storage lock poisoned");
        cells.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trips() -> Result<()> {
        let store = MemoryStore::new();
        assert_eq!(store.get("missing")?, None);

        store.put("k", "v")?;
        assert_eq!(store.get("k")?, Some("v".to_string()));

        store.put("k", "v2")?;
        assert_eq!(store.get("k")?, Some("v2".to_string()));

        store.remove("k")?;
        assert_eq!(store.get("k")?, None);
        Ok(())
    }

    #[test]
    fn remove_on_absent_key_is_noop() -> Result<()> {
        let store = MemoryStore::new();
        store.remove("never-set")?;
        Ok(())
    }
}
