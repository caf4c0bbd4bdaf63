//! A content-store implementation that materializes versioned bundle content
//! locally and serves it back without touching the source when the requested
//! fingerprint is already present.

mod cache;
mod errors;
mod hash;
mod sources;
mod store;

pub use cache::{ContentCache, DiskContentCache, MemoryContentCache};
pub use errors::{Error, Result};
pub use hash::{BundleVersion, ContentHash};
pub use sources::{ContentAsyncRead, ContentSource, DirContentSource, MemoryContentSource};
pub use store::{BundleStore, CachedStore};
