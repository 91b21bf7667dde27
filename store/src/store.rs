use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use fabric_config::StoreConfig;
use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::kvdb::KeyValueDb;
use crate::lru::BoundedCache;

/// Namespace-addressed document store.
///
/// Handles are opened on first touch and kept in a [`BoundedCache`]; a handle
/// pushed out by capacity is dumped before it is dropped, so eviction never
/// loses a write. The store is `Sync` and may be shared behind an `Arc`.
pub struct Store {
    dir: PathBuf,
    autodump: bool,
    handles: Mutex<BoundedCache<KeyValueDb>>,
}

impl Store {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, capacity: usize, autodump: bool) -> Self {
        let cache = BoundedCache::new(capacity).with_evict(Box::new(|name: &str, db: KeyValueDb| {
            tracing::debug!(namespace = name, "Evicting store handle");
            if let Err(e) = db.dump() {
                tracing::error!(namespace = name, "Failed to flush evicted handle: {e}");
            }
        }));
        Self {
            dir: dir.into(),
            autodump,
            handles: Mutex::new(cache),
        }
    }

    #[must_use]
    pub fn from_config(config: &StoreConfig, autodump: bool) -> Self {
        Self::new(config.path.clone(), config.cache_capacity, autodump)
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Value stored under `key`, treating an explicit JSON `null` as absent.
    pub fn get(&self, ns: &str, key: &str) -> Result<Option<Value>, StoreError> {
        self.with_handle(ns, |db| {
            Ok(db.get(key).filter(|value| !value.is_null()).cloned())
        })
    }

    pub fn get_or(&self, ns: &str, key: &str, default: Value) -> Result<Value, StoreError> {
        Ok(self.get(ns, key)?.unwrap_or(default))
    }

    pub fn set(&self, ns: &str, key: &str, value: Value) -> Result<(), StoreError> {
        self.with_handle(ns, |db| db.set(key, value))
    }

    pub fn rem(&self, ns: &str, key: &str) -> Result<(), StoreError> {
        self.with_handle(ns, |db| db.rem(key))
    }

    /// Snapshot of every key in the namespace.
    pub fn all(&self, ns: &str) -> Result<Map<String, Value>, StoreError> {
        self.with_handle(ns, |db| Ok(db.all().clone()))
    }

    /// Close the namespace and delete its backing document.
    pub fn drop_namespace(&self, ns: &str) -> Result<(), StoreError> {
        let cached = self.lock().remove(ns);
        let db = match cached {
            Some(db) => db,
            None => KeyValueDb::open(&self.dir, ns, false)?,
        };
        tracing::debug!(namespace = ns, "Dropping namespace");
        db.destroy()
    }

    /// Forget the cached handle so the next access re-reads the document.
    /// Unsaved changes in the handle are discarded.
    pub fn reload(&self, ns: &str) {
        self.lock().remove(ns);
    }

    pub fn flush(&self, ns: &str) -> Result<(), StoreError> {
        self.with_handle(ns, |db| db.dump())
    }

    pub fn flush_all(&self) -> Result<(), StoreError> {
        let handles = self.lock();
        for db in handles.values() {
            db.dump()?;
        }
        Ok(())
    }

    fn with_handle<T>(
        &self,
        ns: &str,
        f: impl FnOnce(&mut KeyValueDb) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut handles = self.lock();
        if let Some(db) = handles.get(ns) {
            return f(db);
        }
        let db = KeyValueDb::open(&self.dir, ns, self.autodump)?;
        f(handles.put(ns, db))
    }

    fn lock(&self) -> MutexGuard<'_, BoundedCache<KeyValueDb>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.lock().drain(|name, db| {
            if let Err(e) = db.dump() {
                tracing::error!(namespace = name, "Failed to flush store handle on close: {e}");
            }
        });
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("dir", &self.dir)
            .field("autodump", &self.autodump)
            .field("open", &self.lock().len())
            .finish()
    }
}
