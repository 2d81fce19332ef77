//! Persistent Map
//!
//! String-keyed map with per-key atomic updates, written through to
//! `<dir>/<namespace>.json` after every mutation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::{read_json, write_json_atomic};
use crate::error::Result;

/// Thread-safe map persisted as a JSON file.
///
/// Reads and writes of a single key are atomic. There are no cross-key
/// transactions. An in-memory map (no backing file) is used when the owner
/// was never bound to a directory.
pub struct PersistentMap<V> {
    namespace: String,
    path: Option<PathBuf>,
    entries: DashMap<String, V>,
    /// Serializes file flushes
    flush_lock: Mutex<()>,
}

impl<V> PersistentMap<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync,
{
    /// Open (or create) the map stored under `dir` as `<namespace>.json`.
    pub fn open(dir: &Path, namespace: &str) -> Result<Self> {
        let path = dir.join(format!("{}.json", namespace));
        let stored: BTreeMap<String, V> = read_json(&path)?.unwrap_or_default();

        debug!(
            namespace = %namespace,
            path = %path.display(),
            entries = stored.len(),
            "Opened persistent map"
        );

        Ok(Self {
            namespace: namespace.to_string(),
            path: Some(path),
            entries: stored.into_iter().collect(),
            flush_lock: Mutex::new(()),
        })
    }

    /// Create a map that lives only in memory.
    pub fn in_memory(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            path: None,
            entries: DashMap::new(),
            flush_lock: Mutex::new(()),
        }
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Insert a value, returning the previous one.
    pub fn insert(&self, key: impl Into<String>, value: V) -> Result<Option<V>> {
        let previous = self.entries.insert(key.into(), value);
        self.flush()?;
        Ok(previous)
    }

    /// Remove a key, returning its value if it was present.
    pub fn remove(&self, key: &str) -> Result<Option<V>> {
        let removed = self.entries.remove(key).map(|(_, value)| value);
        if removed.is_some() {
            self.flush()?;
        }
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Point-in-time copy of all entries, ordered by key.
    pub fn snapshot(&self) -> BTreeMap<String, V> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Write the current contents to disk.
    pub fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        // Snapshot under the lock so the last flush always carries the latest state
        let _guard = self.flush_lock.lock();
        write_json_atomic(path, &self.snapshot())
    }
}

impl<V> std::fmt::Debug for PersistentMap<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentMap")
            .field("namespace", &self.namespace)
            .field("path", &self.path)
            .field("entries", &self.entries.len())
            .finish()
    }
}
