//! String-keyed persistent storage.
//!
//! Every durable value notula keeps (the Granola access credential, the
//! cached meetings snapshot, memories, context handoffs) lives under a
//! distinct string key in a [`KvStore`]. Components receive the store as an
//! injected collaborator so tests can substitute [`InMemoryStore`].

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tempfile::NamedTempFile;

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, String>;
    fn set_many(&self, entries: &[(&str, String)]) -> Result<(), String>;
    fn remove_many(&self, keys: &[&str]) -> Result<(), String>;

    fn set(&self, key: &str, value: &str) -> Result<(), String> {
        self.set_many(&[(key, value.to_string())])
    }

    fn remove(&self, key: &str) -> Result<(), String> {
        self.remove_many(&[key])
    }
}

/// File-backed store holding all keys in one JSON document. Writes go through
/// a temp file in the same directory so the original is only replaced after a
/// complete write.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> Result<BTreeMap<String, String>, String> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(format!("failed to read {}: {err}", self.path.display())),
        };
        serde_json::from_str(&raw)
            .map_err(|err| format!("failed to parse {}: {err}", self.path.display()))
    }

    fn persist(&self, values: &BTreeMap<String, String>) -> Result<(), String> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)
            .map_err(|err| format!("failed to create {}: {err}", parent.display()))?;
        let mut temp_file = NamedTempFile::new_in(parent).map_err(|err| err.to_string())?;
        let encoded = serde_json::to_string_pretty(values).map_err(|err| err.to_string())?;
        temp_file
            .write_all(encoded.as_bytes())
            .map_err(|err| err.to_string())?;
        temp_file.flush().map_err(|err| err.to_string())?;
        temp_file
            .persist(&self.path)
            .map_err(|err| err.to_string())?;
        Ok(())
    }
}

impl KvStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<String>, String> {
        Ok(self.load()?.get(key).cloned())
    }

    fn set_many(&self, entries: &[(&str, String)]) -> Result<(), String> {
        let mut values = self.load()?;
        for (key, value) in entries {
            values.insert((*key).to_string(), value.clone());
        }
        self.persist(&values)
    }

    fn remove_many(&self, keys: &[&str]) -> Result<(), String> {
        let mut values = self.load()?;
        let mut changed = false;
        for key in keys {
            changed |= values.remove(*key).is_some();
        }
        if changed {
            self.persist(&values)?;
        }
        Ok(())
    }
}

/// Ephemeral store for tests and one-off sessions.
#[derive(Default)]
pub struct InMemoryStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for InMemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, String> {
        let values = self
            .values
            .lock()
            .map_err(|_| "storage lock poisoned".to_string())?;
        Ok(values.get(key).cloned())
    }

    fn set_many(&self, entries: &[(&str, String)]) -> Result<(), String> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| "storage lock poisoned".to_string())?;
        for (key, value) in entries {
            values.insert((*key).to_string(), value.clone());
        }
        Ok(())
    }

    fn remove_many(&self, keys: &[&str]) -> Result<(), String> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| "storage lock poisoned".to_string())?;
        for key in keys {
            values.remove(*key);
        }
        Ok(())
    }
}
