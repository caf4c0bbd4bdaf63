use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Mutex,
};

use tracing::warn;

/// A simple persisted string key/value store, used to remember the last
/// used patch across restarts.
pub trait Prefs: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
}

impl<T: Prefs + ?Sized> Prefs for std::sync::Arc<T> {
    fn get(&self, key: &str) -> Option<String> {
        self.as_ref().get(key)
    }

    fn set(&self, key: &str, value: &str) {
        self.as_ref().set(key, value);
    }
}

/// In-process preferences; nothing survives a restart.
#[derive(Default)]
pub struct MemoryPrefs {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryPrefs {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Prefs for MemoryPrefs {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().unwrap().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }
}

/// Preferences persisted as a single JSON map file. Writes are best-effort:
/// a failure is logged and the in-memory view stays authoritative for the
/// rest of the session.
pub struct FilePrefs {
    path: PathBuf,
    values: Mutex<HashMap<String, String>>,
}

impl FilePrefs {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = std::fs::read(&path)
            .ok()
            .and_then(|data| serde_json::from_slice(&data).ok())
            .unwrap_or_default();
        Self {
            path,
            values: Mutex::new(values),
        }
    }

    fn flush(&self, values: &HashMap<String, String>) {
        let data = serde_json::to_vec_pretty(values).expect("string map serialization");
        if let Err(err) = std::fs::write(&self.path, data) {
            warn!("failed to persist prefs to {}: {}", self.path.display(), err);
        }
    }
}

impl Prefs for FilePrefs {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().unwrap().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let mut values = self.values.lock().unwrap();
        values.insert(key.to_string(), value.to_string());
        self.flush(&values);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_prefs_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.json");

        {
            let prefs = FilePrefs::new(&path);
            assert_eq!(prefs.get("last_patch"), None);
            prefs.set("last_patch", "{\"deployTime\":1}");
        }

        let prefs = FilePrefs::new(&path);
        assert_eq!(prefs.get("last_patch").as_deref(), Some("{\"deployTime\":1}"));
    }
}
