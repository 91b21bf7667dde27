//! A single namespace document on disk.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fabric_utils::{FileSyncPolicy, atomic_write};
use serde_json::{Map, Value};

use crate::error::StoreError;

/// One JSON object persisted at `{dir}/{name}.json`.
///
/// Mutations stay in memory until [`dump`](Self::dump) unless the handle was
/// opened with `autodump`, in which case every `set`/`rem` writes through.
#[derive(Debug)]
pub struct KeyValueDb {
    name: String,
    path: PathBuf,
    autodump: bool,
    data: Map<String, Value>,
}

impl KeyValueDb {
    /// Open (or lazily create) the document for `name` under `dir`.
    ///
    /// A document that cannot be parsed is deleted and replaced by an empty
    /// one; the lost contents are logged, not recovered.
    pub fn open(dir: &Path, name: &str, autodump: bool) -> Result<Self, StoreError> {
        validate_name(name)?;
        fs::create_dir_all(dir).map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = dir.join(format!("{name}.json"));
        let data = load(&path)?;
        Ok(Self {
            name: name.to_string(),
            path,
            autodump,
            data,
        })
    }

    /// Re-read the document from disk, discarding unsaved changes.
    pub fn reload(&mut self) -> Result<(), StoreError> {
        self.data = load(&self.path)?;
        Ok(())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn exists(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }

    #[must_use]
    pub fn all(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn set(&mut self, key: &str, value: Value) -> Result<(), StoreError> {
        self.data.insert(key.to_string(), value);
        if self.autodump {
            self.dump()?;
        }
        Ok(())
    }

    pub fn rem(&mut self, key: &str) -> Result<(), StoreError> {
        self.data.remove(key);
        if self.autodump {
            self.dump()?;
        }
        Ok(())
    }

    /// Write the document to disk atomically.
    pub fn dump(&self) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(&self.data).map_err(|source| StoreError::Serialize {
            name: self.name.clone(),
            source,
        })?;
        atomic_write(&self.path, &bytes, FileSyncPolicy::SyncAll).map_err(|source| {
            StoreError::Io {
                path: self.path.clone(),
                source,
            }
        })
    }

    /// Discard the document and delete its backing file.
    pub fn destroy(self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io {
                path: self.path,
                source,
            }),
        }
    }
}

fn validate_name(name: &str) -> Result<(), StoreError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if bad {
        return Err(StoreError::InvalidNamespace(name.to_string()));
    }
    Ok(())
}

fn load(path: &Path) -> Result<Map<String, Value>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Map::new()),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) | Err(_) => {
            tracing::error!(path = %path.display(), "Store document is corrupted, recreating it");
            if let Err(e) = fs::remove_file(path) {
                tracing::warn!(path = %path.display(), "Failed to remove corrupted document: {e}");
            }
            Ok(Map::new())
        }
    }
}
