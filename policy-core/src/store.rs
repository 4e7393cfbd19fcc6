//! Key-value configuration store used for filter and rule persistence
//!
//! The surrounding proxy owns the real storage. This module defines the seam
//! plus two backends: an in-memory map and a JSON file, and a scoped store
//! that reads the project scope before falling back to the global profile.

use crate::error::PolicyError;
use crate::Result;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Key holding the content (recording) filter
pub const CONTENT_FILTER_KEY: &str = "MITM_CONTENT_FILTER";
/// Key holding the hijack filter
pub const HIJACK_FILTER_KEY: &str = "MITM_HIJACK_FILTER";
/// Key holding the replacement rule list
pub const REPLACER_RULES_KEY: &str = "MITM_REPLACER_RULES";

/// Minimal string key-value store
pub trait ConfigStore: Send + Sync {
    /// Fetch a value; `Ok(None)` when the key was never written
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Volatile store backed by a concurrent map
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Store persisted as a single JSON object on disk
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl ConfigStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| PolicyError::store("get", "store lock poisoned"))?;
        Ok(self.read_all()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| PolicyError::store("set", "store lock poisoned"))?;
        let mut entries = self.read_all()?;
        entries.insert(key.to_string(), value.to_string());

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&entries)?)?;
        debug!(key, path = %self.path.display(), "Persisted configuration value");
        Ok(())
    }
}

/// Project-scoped store with a global-profile fallback
///
/// Reads prefer a non-blank project value; writes always go to the project.
#[derive(Clone)]
pub struct ScopedStore {
    project: Arc<dyn ConfigStore>,
    global: Arc<dyn ConfigStore>,
}

impl ScopedStore {
    pub fn new(project: Arc<dyn ConfigStore>, global: Arc<dyn ConfigStore>) -> Self {
        Self { project, global }
    }
}

impl ConfigStore for ScopedStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match self.project.get(key)? {
            Some(value) if !value.trim().is_empty() => Ok(Some(value)),
            _ => self.global.get(key),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.project.set(key, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        assert!(store.get("missing").unwrap().is_none());
        store.set("k", "v").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn test_file_store_persists_across_instances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let store = FileStore::new(&path);
        assert!(store.get(CONTENT_FILTER_KEY).unwrap().is_none());
        store.set(CONTENT_FILTER_KEY, "{}").unwrap();
        store.set(HIJACK_FILTER_KEY, "[]").unwrap();

        let reopened = FileStore::new(&path);
        assert_eq!(reopened.get(CONTENT_FILTER_KEY).unwrap().as_deref(), Some("{}"));
        assert_eq!(reopened.get(HIJACK_FILTER_KEY).unwrap().as_deref(), Some("[]"));
    }

    #[test]
    fn test_scoped_store_falls_back_to_global() {
        let project = Arc::new(MemoryStore::new());
        let global = Arc::new(MemoryStore::new());
        global.set("k", "global").unwrap();
        project.set("blank", "  ").unwrap();
        global.set("blank", "from-global").unwrap();

        let scoped = ScopedStore::new(project.clone(), global.clone());
        assert_eq!(scoped.get("k").unwrap().as_deref(), Some("global"));
        assert_eq!(scoped.get("blank").unwrap().as_deref(), Some("from-global"));

        scoped.set("k", "project").unwrap();
        assert_eq!(scoped.get("k").unwrap().as_deref(), Some("project"));
        assert_eq!(global.get("k").unwrap().as_deref(), Some("global"));
    }
}
