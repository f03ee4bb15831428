//! Durable key-value storage used by the flag cache.
use std::{
    collections::HashMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use crate::{Error, Result};

/// Durable key-value storage.
///
/// Implementations must be safe to call from multiple threads. The storage tracks the order in
/// which keys were last written so the cache can evict the least recently updated entries.
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, making `key` the most recently written key.
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove `key`. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// All keys, most recently written first.
    fn list_keys_by_recency(&self) -> Result<Vec<String>>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        (**self).put(key, value)
    }

    fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key)
    }

    fn list_keys_by_recency(&self) -> Result<Vec<String>> {
        (**self).list_keys_by_recency()
    }
}

#[derive(Default)]
struct MemoryState {
    values: HashMap<String, Vec<u8>>,
    /// Least recently written first.
    order: Vec<String>,
}

/// Volatile in-memory storage. Useful for tests and for hosts without a writable filesystem.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .expect("thread holding memory store lock should not panic")
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock().values.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut state = self.lock();
        state.order.retain(|k| k != key);
        state.order.push(key.to_owned());
        state.values.insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.lock();
        state.order.retain(|k| k != key);
        state.values.remove(key);
        Ok(())
    }

    fn list_keys_by_recency(&self) -> Result<Vec<String>> {
        Ok(self.lock().order.iter().rev().cloned().collect())
    }
}

const MANIFEST_FILE: &str = "manifest.json";

/// Storage keeping one file per key in a directory, plus a manifest recording write order.
///
/// Files are written to a temporary path and renamed into place, so a crash never leaves a
/// half-written entry behind.
pub struct FileStore {
    directory: PathBuf,
    /// Serializes manifest read-modify-write cycles.
    manifest_lock: Mutex<()>,
}

impl FileStore {
    /// Open (and create if needed) a store in `directory`.
    pub fn open(directory: impl Into<PathBuf>) -> Result<FileStore> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;
        Ok(FileStore {
            directory,
            manifest_lock: Mutex::new(()),
        })
    }

    #[allow(missing_docs)]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn entry_path(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(Error::InvalidStorageKey(key.to_owned()));
        }
        Ok(self.directory.join(format!("{key}.entry")))
    }

    fn read_manifest(&self) -> Result<Vec<String>> {
        match fs::read(self.directory.join(MANIFEST_FILE)) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn write_manifest(&self, order: &[String]) -> Result<()> {
        write_atomic(
            &self.directory.join(MANIFEST_FILE),
            &serde_json::to_vec(order)?,
        )
    }

    fn lock_manifest(&self) -> std::sync::MutexGuard<'_, ()> {
        self.manifest_lock
            .lock()
            .expect("thread holding manifest lock should not panic")
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.entry_path(key)?) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.entry_path(key)?;
        let _guard = self.lock_manifest();
        write_atomic(&path, value)?;

        let mut order = self.read_manifest()?;
        order.retain(|k| k != key);
        order.push(key.to_owned());
        self.write_manifest(&order)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.entry_path(key)?;
        let _guard = self.lock_manifest();
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let mut order = self.read_manifest()?;
        order.retain(|k| k != key);
        self.write_manifest(&order)
    }

    fn list_keys_by_recency(&self) -> Result<Vec<String>> {
        let _guard = self.lock_manifest();
        let mut order = self.read_manifest()?;
        order.reverse();
        Ok(order)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
