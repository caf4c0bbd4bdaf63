use std::{
    collections::HashMap,
    fmt::Display,
    fs,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use tracing::warn;

use crate::{ContentHash, Result};

/// A `ContentCache` is the local half of the store: materialized bundle
/// content keyed by name and version fingerprint.
///
/// Implementations are plain blocking storage. All the latency lives in the
/// remote source; the cache is only ever consulted from the orchestrating
/// side, which needs synchronous short-circuit and purge decisions.
pub trait ContentCache: Display + Send + Sync {
    /// Read the materialized content for `(name, hash)`, if any.
    fn read(&self, name: &str, hash: &ContentHash) -> Option<Vec<u8>>;

    /// Materialize content under `(name, hash)`, replacing any previous
    /// entry for the same key.
    fn write(&self, name: &str, hash: &ContentHash, data: &[u8]) -> Result<()>;

    /// Whether content is materialized under `(name, hash)`.
    fn contains(&self, name: &str, hash: &ContentHash) -> bool;

    /// Drop the entry for `(name, hash)`, if any.
    fn remove(&self, name: &str, hash: &ContentHash);

    /// Drop every entry.
    fn clear(&self);
}

impl<T: ContentCache + ?Sized> ContentCache for Arc<T> {
    fn read(&self, name: &str, hash: &ContentHash) -> Option<Vec<u8>> {
        self.as_ref().read(name, hash)
    }

    fn write(&self, name: &str, hash: &ContentHash, data: &[u8]) -> Result<()> {
        self.as_ref().write(name, hash, data)
    }

    fn contains(&self, name: &str, hash: &ContentHash) -> bool {
        self.as_ref().contains(name, hash)
    }

    fn remove(&self, name: &str, hash: &ContentHash) {
        self.as_ref().remove(name, hash);
    }

    fn clear(&self) {
        self.as_ref().clear();
    }
}

/// A `MemoryContentCache` keeps materialized content in RAM.
#[derive(Default)]
pub struct MemoryContentCache {
    entries: Mutex<HashMap<(String, ContentHash), Vec<u8>>>,
}

impl MemoryContentCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Display for MemoryContentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "in-memory")
    }
}

impl ContentCache for MemoryContentCache {
    fn read(&self, name: &str, hash: &ContentHash) -> Option<Vec<u8>> {
        self.entries
            .lock()
            .unwrap()
            .get(&(name.to_string(), *hash))
            .cloned()
    }

    fn write(&self, name: &str, hash: &ContentHash, data: &[u8]) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert((name.to_string(), *hash), data.to_vec());
        Ok(())
    }

    fn contains(&self, name: &str, hash: &ContentHash) -> bool {
        self.entries
            .lock()
            .unwrap()
            .contains_key(&(name.to_string(), *hash))
    }

    fn remove(&self, name: &str, hash: &ContentHash) {
        self.entries
            .lock()
            .unwrap()
            .remove(&(name.to_string(), *hash));
    }

    fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

/// A `DiskContentCache` materializes content as one file per `(name, hash)`
/// entry in a root directory.
///
/// File names hex-encode the bundle name so that names containing path
/// separators cannot collide or escape the root.
pub struct DiskContentCache {
    root: PathBuf,
}

impl DiskContentCache {
    /// Opens (creating it if needed) a cache rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn entry_path(&self, name: &str, hash: &ContentHash) -> PathBuf {
        self.root.join(format!("{}-{}", hex::encode(name), hash))
    }
}

impl Display for DiskContentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "disk:{}", self.root.display())
    }
}

impl ContentCache for DiskContentCache {
    fn read(&self, name: &str, hash: &ContentHash) -> Option<Vec<u8>> {
        fs::read(self.entry_path(name, hash)).ok()
    }

    fn write(&self, name: &str, hash: &ContentHash, data: &[u8]) -> Result<()> {
        fs::write(self.entry_path(name, hash), data)?;
        Ok(())
    }

    fn contains(&self, name: &str, hash: &ContentHash) -> bool {
        self.entry_path(name, hash).is_file()
    }

    fn remove(&self, name: &str, hash: &ContentHash) {
        let _res = fs::remove_file(self.entry_path(name, hash));
    }

    fn clear(&self) {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("failed to enumerate cache dir {}: {}", self.root.display(), err);
                return;
            }
        };
        for entry in entries.flatten() {
            let _res = fs::remove_file(entry.path());
        }
    }
}
