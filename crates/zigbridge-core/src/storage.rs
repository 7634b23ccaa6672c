/*!
 * Persistent key/value storage for ZigBridge.
 *
 * The bridge persists its controller record and machine identifier through a
 * [`KeyValueStore`]. The store also owns the application data directory that
 * the coordinator database is placed under.
 */
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// File name of the JSON document backing a [`FileStore`]
pub const STORE_FILE: &str = "storage.json";

/// Key/value persistence used by the bridge
pub trait KeyValueStore: Send + Sync + Debug {
    /// Read the raw value stored under `key`
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;

    /// Replace the value stored under `key`, persisting it immediately
    fn put(&self, key: &str, value: serde_json::Value) -> Result<()>;

    /// Directory for application data owned by this store
    fn data_dir(&self) -> &Path;
}

impl dyn KeyValueStore {
    /// Read and deserialize the value stored under `key`
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(raw) => Ok(Some(serde_json::from_value(raw)?)),
            None => Ok(None),
        }
    }

    /// Serialize and store `value` under `key`
    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.put(key, serde_json::to_value(value)?)
    }
}

/// A shared, dynamically typed store
pub type SharedStore = Arc<dyn KeyValueStore>;

/// Store persisting every key in one JSON document under the data directory
#[derive(Debug)]
pub struct FileStore {
    data_dir: PathBuf,
    path: PathBuf,
    entries: RwLock<BTreeMap<String, serde_json::Value>>,
}

impl FileStore {
    /// Open (or create) the store rooted at `data_dir`
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;

        let path = data_dir.join(STORE_FILE);
        let entries = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            if contents.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&contents).map_err(|e| {
                    Error::storage(format!("Failed to parse {}: {}", path.display(), e))
                })?
            }
        } else {
            BTreeMap::new()
        };

        debug!("Opened store at {} with {} keys", path.display(), entries.len());
        Ok(Self {
            data_dir,
            path,
            entries: RwLock::new(entries),
        })
    }

    /// Path of the backing JSON document
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, entries: &BTreeMap<String, serde_json::Value>) -> Result<()> {
        let contents = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &self.path)?;
        trace!("Flushed store to {}", self.path.display());
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| Error::storage("Failed to acquire read lock on store"))?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| Error::storage("Failed to acquire write lock on store"))?;
        entries.insert(key.to_string(), value);
        self.flush(&entries)
    }

    fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

/// Volatile store, mainly for tests and embedding without persistence
#[derive(Debug)]
pub struct MemoryStore {
    data_dir: PathBuf,
    entries: RwLock<BTreeMap<String, serde_json::Value>>,
}

impl MemoryStore {
    /// Create an empty store that reports `data_dir` as its data directory
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            entries: RwLock::new(BTreeMap::new()),
        }
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| Error::storage("Failed to acquire read lock on store"))?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.entries
            .write()
            .map_err(|_| Error::storage("Failed to acquire write lock on store"))?
            .insert(key.to_string(), value);
        Ok(())
    }

    fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}
