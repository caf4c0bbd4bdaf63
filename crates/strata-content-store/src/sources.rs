use std::{
    collections::HashMap,
    fmt::Display,
    path::PathBuf,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tracing::debug;

use crate::{Error, Result};

/// A reader over the content of a single bundle.
pub type ContentAsyncRead = Pin<Box<dyn AsyncRead + Send>>;

/// A `ContentSource` is the remote half of the store: it serves the content
/// currently published under a bundle name.
///
/// Version fingerprints are a client-side concern; the source always returns
/// whatever is live for the name.
#[async_trait]
pub trait ContentSource: Display + Send + Sync {
    /// Returns an async reader over the content published under `name`,
    /// along with its size when known.
    ///
    /// If the name does not match any content, `Error::NotFound` is returned.
    async fn fetch(&self, name: &str) -> Result<(ContentAsyncRead, Option<u64>)>;
}

#[async_trait]
impl<T: ContentSource + ?Sized> ContentSource for Arc<T> {
    async fn fetch(&self, name: &str) -> Result<(ContentAsyncRead, Option<u64>)> {
        self.as_ref().fetch(name).await
    }
}

#[async_trait]
impl<T: ContentSource + ?Sized> ContentSource for Box<T> {
    async fn fetch(&self, name: &str) -> Result<(ContentAsyncRead, Option<u64>)> {
        self.as_ref().fetch(name).await
    }
}

/// A `MemoryContentSource` is a source that serves content published into
/// process memory.
///
/// It also counts fetches, which makes it the natural double for transfer
/// deduplication tests.
#[derive(Default, Clone)]
pub struct MemoryContentSource {
    inner: Arc<MemorySourceInner>,
}

#[derive(Default)]
struct MemorySourceInner {
    content: Mutex<HashMap<String, Vec<u8>>>,
    fetch_count: AtomicUsize,
}

impl MemoryContentSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish (or replace) the content served under `name`.
    pub fn publish(&self, name: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.inner
            .content
            .lock()
            .unwrap()
            .insert(name.into(), data.into());
    }

    /// Remove the content served under `name`.
    pub fn unpublish(&self, name: &str) {
        self.inner.content.lock().unwrap().remove(name);
    }

    /// The number of fetches served so far, including failed ones.
    pub fn fetch_count(&self) -> usize {
        self.inner.fetch_count.load(Ordering::SeqCst)
    }
}

impl Display for MemoryContentSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "in-memory")
    }
}

#[async_trait]
impl ContentSource for MemoryContentSource {
    async fn fetch(&self, name: &str) -> Result<(ContentAsyncRead, Option<u64>)> {
        self.inner.fetch_count.fetch_add(1, Ordering::SeqCst);

        let content = self.inner.content.lock().unwrap().get(name).cloned();
        match content {
            Some(data) => {
                let size = data.len() as u64;
                Ok((
                    Box::pin(std::io::Cursor::new(data)) as ContentAsyncRead,
                    Some(size),
                ))
            }
            None => Err(Error::NotFound(name.to_string())),
        }
    }
}

/// A `DirContentSource` serves content from files in a directory, one file
/// per bundle name.
pub struct DirContentSource {
    root: PathBuf,
}

impl DirContentSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Display for DirContentSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dir:{}", self.root.display())
    }
}

#[async_trait]
impl ContentSource for DirContentSource {
    async fn fetch(&self, name: &str) -> Result<(ContentAsyncRead, Option<u64>)> {
        let path = self.root.join(name);
        debug!("DirContentSource::fetch({})", path.display());

        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(name.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        let size = file.metadata().await.ok().map(|m| m.len());

        Ok((Box::pin(file) as ContentAsyncRead, size))
    }
}
