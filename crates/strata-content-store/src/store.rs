use std::{
    fmt::Display,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use async_trait::async_trait;
use tokio::io::{AsyncRead, ReadBuf};
use tracing::{debug, warn};

use crate::{BundleVersion, ContentAsyncRead, ContentCache, ContentHash, ContentSource, Result};

/// The storage capability the bundle runtime consumes: pull content by name
/// and version with a local short-circuit, and force-purge by name and
/// fingerprint.
#[async_trait]
pub trait BundleStore: Display + Send + Sync {
    /// Returns a reader over the content for `name` at `version`, along with
    /// its size when known.
    ///
    /// A `Pinned` version short-circuits to locally materialized content when
    /// an identical fingerprint is already present; the other versions always
    /// reach the source.
    async fn pull(
        &self,
        name: &str,
        version: &BundleVersion,
    ) -> Result<(ContentAsyncRead, Option<u64>)>;

    /// Whether content for `(name, hash)` is materialized locally.
    fn contains(&self, name: &str, hash: &ContentHash) -> bool;

    /// Drop the local entry for `(name, hash)`, so the next pinned pull is
    /// forced through the source.
    fn purge(&self, name: &str, hash: &ContentHash);

    /// Drop every local entry.
    fn purge_all(&self);
}

#[async_trait]
impl<T: BundleStore + ?Sized> BundleStore for Arc<T> {
    async fn pull(
        &self,
        name: &str,
        version: &BundleVersion,
    ) -> Result<(ContentAsyncRead, Option<u64>)> {
        self.as_ref().pull(name, version).await
    }

    fn contains(&self, name: &str, hash: &ContentHash) -> bool {
        self.as_ref().contains(name, hash)
    }

    fn purge(&self, name: &str, hash: &ContentHash) {
        self.as_ref().purge(name, hash);
    }

    fn purge_all(&self) {
        self.as_ref().purge_all();
    }
}

#[async_trait]
impl<T: BundleStore + ?Sized> BundleStore for Box<T> {
    async fn pull(
        &self,
        name: &str,
        version: &BundleVersion,
    ) -> Result<(ContentAsyncRead, Option<u64>)> {
        self.as_ref().pull(name, version).await
    }

    fn contains(&self, name: &str, hash: &ContentHash) -> bool {
        self.as_ref().contains(name, hash)
    }

    fn purge(&self, name: &str, hash: &ContentHash) {
        self.as_ref().purge(name, hash);
    }

    fn purge_all(&self) {
        self.as_ref().purge_all();
    }
}

/// A `CachedStore` composes a remote source with a local cache into the
/// read-through [`BundleStore`] the runtime consumes.
///
/// Pinned pulls that miss locally are written through to the cache as the
/// stream is consumed; the entry is only committed once the stream reaches
/// EOF, so an aborted transfer never leaves a partial materialization.
pub struct CachedStore<S, C> {
    source: S,
    cache: Arc<C>,
}

impl<S: ContentSource, C: ContentCache> CachedStore<S, C> {
    /// Creates a new `CachedStore` over the given source and cache.
    pub fn new(source: S, cache: C) -> Self {
        Self {
            source,
            cache: Arc::new(cache),
        }
    }

    /// The backing cache.
    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// The backing source.
    pub fn source(&self) -> &S {
        &self.source
    }
}

impl<S: Display, C: Display> Display for CachedStore<S, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({} cached by {})", self.source, self.cache)
    }
}

#[async_trait]
impl<S, C> BundleStore for CachedStore<S, C>
where
    S: ContentSource,
    C: ContentCache + 'static,
{
    async fn pull(
        &self,
        name: &str,
        version: &BundleVersion,
    ) -> Result<(ContentAsyncRead, Option<u64>)> {
        match version.cache_key() {
            Some(hash) => {
                if let Some(data) = self.cache.read(name, hash) {
                    debug!("CachedStore::pull({name}, {hash}) -> local hit");
                    let size = data.len() as u64;
                    return Ok((
                        Box::pin(std::io::Cursor::new(data)) as ContentAsyncRead,
                        Some(size),
                    ));
                }

                debug!("CachedStore::pull({name}, {hash}) -> local miss");
                let (reader, size) = self.source.fetch(name).await?;
                let reader = CacheWriteReader {
                    inner: reader,
                    cache: Arc::clone(&self.cache),
                    name: name.to_string(),
                    hash: *hash,
                    pending: Vec::with_capacity(size.unwrap_or(0) as usize),
                    committed: false,
                };
                Ok((Box::pin(reader) as ContentAsyncRead, size))
            }
            None => {
                debug!("CachedStore::pull({name}) -> unconditional download");
                self.source.fetch(name).await
            }
        }
    }

    fn contains(&self, name: &str, hash: &ContentHash) -> bool {
        self.cache.contains(name, hash)
    }

    fn purge(&self, name: &str, hash: &ContentHash) {
        debug!("CachedStore::purge({name}, {hash})");
        self.cache.remove(name, hash);
    }

    fn purge_all(&self) {
        self.cache.clear();
    }
}

/// Buffers a remote stream and commits it to the local cache once the stream
/// reaches EOF.
struct CacheWriteReader<C> {
    inner: ContentAsyncRead,
    cache: Arc<C>,
    name: String,
    hash: ContentHash,
    pending: Vec<u8>,
    committed: bool,
}

impl<C: ContentCache> AsyncRead for CacheWriteReader<C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        let filled_before = buf.filled().len();
        match this.inner.as_mut().poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let read = &buf.filled()[filled_before..];
                if read.is_empty() {
                    // EOF: commit the full payload exactly once.
                    if !this.committed {
                        this.committed = true;
                        if let Err(err) =
                            this.cache.write(&this.name, &this.hash, &this.pending)
                        {
                            warn!(
                                "failed to materialize `{}` ({}) locally: {}",
                                this.name, this.hash, err
                            );
                        }
                    }
                } else {
                    this.pending.extend_from_slice(read);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}
