//! JSON-file-backed store for state that outlives a single process session.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

use super::KeyValueStore;

/// Durable store persisting every entry to a single JSON object on disk.
///
/// Writes go through an in-memory map and are flushed to disk before `put`
/// or `remove` returns. A corrupt or unreadable file is not fatal: the
/// store starts empty and logs the anomaly, matching the fail-open posture
/// of its main consumer, the rate limiter.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    cells: Mutex<HashMap<String, String>>,
}

impl FileStore {
    /// Open (or create) the store at `path`, loading any existing entries.
    ///
    /// # Errors
    /// Returns an error if the parent directory cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create state directory {}", parent.display()))?;
        }

        let cells = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<HashMap<String, String>>(&raw) {
                Ok(map) => map,
                Err(err) => {
                    warn!("discarding corrupt state file {}: {err}", path.display());
                    HashMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => {
                warn!("cannot read state file {}: {err}", path.display());
                HashMap::new()
            }
        };

        Ok(Self {
            path,
            cells: Mutex::new(cells),
        })
    }

    fn flush(&self, cells: &HashMap<String, String>) -> Result<()> {
        let raw = serde_json::to_string(cells).context("failed to serialize state")?;
        fs::write(&self.path, raw)
            .with_context(|| format!("failed to write state file {}", self.path.display()))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let cells = self.cells.lock().expect("storage lock poisoned");
        Ok(cells.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut cells = self.cells.lock().expect("storage lock poisoned");
        cells.insert(key.to_string(), value.to_string());
        self.flush(&cells)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut cells = self.cells.lock().expect("storage lock poisoned");
        if cells.remove(key).is_some() {
            self.flush(&cells)?;
        }
        Ok(())
    }
}
