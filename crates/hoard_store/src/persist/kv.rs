//! Synchronous string-keyed storage
//!
//! One flat namespace of text records. [`FileStore`] keeps every record in a
//! single JSON object file and rewrites it on each change; [`MemoryStore`]
//! keeps them in process.

use crate::error::StorageError;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A synchronous key-value backend
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
    fn keys(&self) -> Result<Vec<String>, StorageError>;
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, String>>,
    writes: AtomicUsize,
    read_only: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record without counting it as a write
    pub fn with_record(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.records.lock().insert(key.into(), value.into());
        self
    }

    /// Number of successful `set` calls
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every write fail, as a full or locked disk would
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.records.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(StorageError::Other(format!("store is read-only, cannot set `{key}`")));
        }
        self.records.lock().insert(key.to_string(), value.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.records.lock().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.records.lock().keys().cloned().collect())
    }
}

/// Store backed by one JSON object file
pub struct FileStore {
    path: PathBuf,
    /// Loaded lazily on first access
    records: Mutex<Option<BTreeMap<String, String>>>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: Mutex::new(None),
        }
    }

    /// `local.json` inside `dir`
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join("local.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_records<R>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, String>) -> R,
    ) -> Result<R, StorageError> {
        let mut guard = self.records.lock();
        if guard.is_none() {
            *guard = Some(self.read_file()?);
        }
        let records = guard.get_or_insert_with(BTreeMap::new);
        Ok(f(records))
    }

    fn read_file(&self) -> Result<BTreeMap<String, String>, StorageError> {
        match fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn write_file(&self, records: &BTreeMap<String, String>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(records)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.with_records(|records| records.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let snapshot = self.with_records(|records| {
            records.insert(key.to_string(), value.to_string());
            records.clone()
        })?;
        self.write_file(&snapshot)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let snapshot = self.with_records(|records| records.remove(key).map(|_| records.clone()))?;
        match snapshot {
            Some(records) => self.write_file(&records),
            None => Ok(()),
        }
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.with_records(|records| records.keys().cloned().collect())
    }
}
