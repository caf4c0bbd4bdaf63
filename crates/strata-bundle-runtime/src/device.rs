use std::{collections::HashMap, path::PathBuf, sync::Mutex};

use async_trait::async_trait;

/// A read-only namespace of loose payloads, mounted next to the bundle
/// store: the built-in "resources" namespace, an arbitrary-URI web
/// namespace, or any substitute strategy selected by configuration.
#[async_trait]
pub trait Device: Send + Sync {
    /// Returns the raw payload for `path`, or `None` when this device cannot
    /// resolve it.
    async fn load(&self, path: &str) -> Option<Vec<u8>>;
}

/// Serves loose files from a directory.
pub struct DirDevice {
    root: PathBuf,
}

impl DirDevice {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Device for DirDevice {
    async fn load(&self, path: &str) -> Option<Vec<u8>> {
        tokio::fs::read(self.root.join(path)).await.ok()
    }
}

/// Serves payloads registered in process memory; mostly a test double.
#[derive(Default)]
pub struct MemoryDevice {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.entries
            .lock()
            .unwrap()
            .insert(path.into(), data.into());
    }
}

#[async_trait]
impl Device for MemoryDevice {
    async fn load(&self, path: &str) -> Option<Vec<u8>> {
        self.entries.lock().unwrap().get(path).cloned()
    }
}
