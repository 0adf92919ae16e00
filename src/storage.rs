//! Durable key-value storage capability.
//!
//! The vault and the notification store never touch the filesystem (or any
//! platform storage) directly; they go through the [`KeyValueStore`] trait
//! so the embedding application decides where session state actually lives.
//!
//! # Implementations
//!
//! - [`FileStore`] - JSON map at `{config_dir}/warren/storage.json`, `0o600`
//!   on unix.
//! - [`MemoryStore`] - in-process map for tests.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Mutex;

/// Abstract durable string-to-string storage.
///
/// All operations are synchronous; callers rely on `set` having hit the
/// backing medium by the time it returns.
pub trait KeyValueStore: Send + Sync {
    /// Read a value. `None` when the key does not exist.
    fn get(&self, key: &str) -> Option<String>;

    /// Write a value, replacing any previous one.
    fn set(&self, key: &str, value: &str);

    /// Remove a key. Removing a missing key is not an error.
    fn remove(&self, key: &str);
}

impl std::fmt::Debug for dyn KeyValueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyValueStore")
    }
}

/// File-backed store: a single JSON object persisted on every write.
///
/// Writes are flushed synchronously. A read failure (missing or corrupt
/// file) degrades to an empty map rather than failing the caller; corrupt
/// data is overwritten on the next write.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl FileStore {
    /// Open (or create) the store at the default location,
    /// `{config_dir}/warren/storage.json`.
    pub fn open_default() -> Result<Self> {
        let dir = dirs::config_dir()
            .context("No config directory available")?
            .join("warren");
        fs::create_dir_all(&dir)?;
        Self::open(dir.join("storage.json"))
    }

    /// Open (or create) a store at an explicit path.
    pub fn open(path: PathBuf) -> Result<Self> {
        let entries = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(map) => map,
                Err(e) => {
                    log::warn!("Storage file corrupt, starting empty: {e}");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn flush(&self, entries: &HashMap<String, String>) {
        let json = match serde_json::to_string_pretty(entries) {
            Ok(json) => json,
            Err(e) => {
                log::error!("Failed to serialize storage: {e}");
                return;
            }
        };

        if let Err(e) = fs::write(&self.path, json) {
            log::error!("Failed to write storage file: {e}");
            return;
        }

        #[cfg(unix)]
        if let Err(e) = fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600)) {
            log::warn!("Failed to tighten storage permissions: {e}");
        }
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .expect("storage lock poisoned")
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let mut entries = self.entries.lock().expect("storage lock poisoned");
        entries.insert(key.to_string(), value.to_string());
        self.flush(&entries);
    }

    fn remove(&self, key: &str) {
        let mut entries = self.entries.lock().expect("storage lock poisoned");
        if entries.remove(key).is_some() {
            self.flush(&entries);
        }
    }
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .expect("storage lock poisoned")
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.entries
            .lock()
            .expect("storage lock poisoned")
            .insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.entries
            .lock()
            .expect("storage lock poisoned")
            .remove(key);
    }
}
