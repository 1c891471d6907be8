//! Small key-value persistence for sync bookkeeping.
//!
//! Cursors and the pending-deletion ledger live here rather than in the
//! record database so they survive a reset of the local store.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};

/// String-keyed persistence with whole-value reads and writes
pub trait KeyValueStore: Send + Sync {
    /// Read a value, `None` when the key was never written or was cleared
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value; `None` removes the key
    fn set(&self, key: &str, value: Option<&str>) -> Result<()>;
}

/// JSON document on disk, rewritten atomically on every change
pub struct FileKeyValueStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileKeyValueStore {
    /// Open the store at `path`, creating parent directories as needed.
    ///
    /// A missing or empty file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let entries = match fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => BTreeMap::new(),
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
                Error::InvalidData(format!("unreadable state file {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn entries(&self) -> Result<MutexGuard<'_, BTreeMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|_| Error::Database("key-value store lock poisoned".to_string()))
    }

    /// Write to a temp file, sync it, then rename over the real file
    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let temp_path = self.path.with_extension("tmp");
        let data = serde_json::to_vec_pretty(entries)?;

        let mut file = File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: Option<&str>) -> Result<()> {
        let mut entries = self.entries()?;
        let previous = match value {
            Some(value) => entries.insert(key.to_string(), value.to_string()),
            None => entries.remove(key),
        };
        if previous.as_deref() == value {
            return Ok(());
        }

        if let Err(e) = self.persist(&entries) {
            // Keep memory consistent with disk
            match previous {
                Some(previous) => entries.insert(key.to_string(), previous),
                None => entries.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }
}

/// Volatile store for tests and ephemeral sessions
#[derive(Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| Error::Database("key-value store lock poisoned".to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: Option<&str>) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::Database("key-value store lock poisoned".to_string()))?;
        match value {
            Some(value) => entries.insert(key.to_string(), value.to_string()),
            None => entries.remove(key),
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_store_survives_reopen() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("state").join("sync.json");

        let store = FileKeyValueStore::open(&path).unwrap();
        assert_eq!(store.get("cursor").unwrap(), None);
        store.set("cursor", Some("123")).unwrap();
        store.set("other", Some("x")).unwrap();
        store.set("other", None).unwrap();
        drop(store);

        let reopened = FileKeyValueStore::open(&path).unwrap();
        assert_eq!(reopened.get("cursor").unwrap().as_deref(), Some("123"));
        assert_eq!(reopened.get("other").unwrap(), None);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn file_store_treats_empty_file_as_empty() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("sync.json");
        fs::write(&path, "").unwrap();

        let store = FileKeyValueStore::open(&path).unwrap();
        assert_eq!(store.get("anything").unwrap(), None);
    }

    #[test]
    fn file_store_rejects_corrupt_file() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("sync.json");
        fs::write(&path, "{not json").unwrap();

        assert!(matches!(
            FileKeyValueStore::open(&path),
            Err(Error::InvalidData(_))
        ));
    }

    #[test]
    fn memory_store_set_and_clear() {
        let store = MemoryKeyValueStore::new();
        store.set("k", Some("v")).unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
        store.set("k", None).unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }
}
