use std::collections::VecDeque;

use thiserror::Error;

use crate::{BundleName, OperationId};

/// Error type for the bundle runtime.
///
/// Operation failures are values, not panics: they surface on the failing
/// operation and in the rolling [`ErrorLog`], and never cross the tick loop
/// as unwinds.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Network or disk failure while fetching a blob.
    #[error("transport error: {0}")]
    Transport(#[from] strata_content_store::Error),

    /// The payload fetched for a bundle failed to decode.
    #[error("`{0}` is not a valid bundle")]
    InvalidBundle(BundleName),

    /// A fetched asset payload failed to decode.
    #[error("failed to decode asset `{0}`: {1}")]
    InvalidAsset(String, String),

    /// A named asset was absent from its bundle or namespace.
    #[error("asset `{0}` was not found")]
    AssetNotFound(OperationId),

    /// A bundle was requested that the active manifest does not know about.
    #[error("bundle `{0}` is not present in the active manifest")]
    BundleNotInManifest(BundleName),

    /// No manifest is active yet; only the manifest bundle itself may be
    /// fetched in this state.
    #[error("no active manifest; call `set_patch` first")]
    ManifestNotSet,

    /// The manifest payload was missing or invalid.
    #[error("manifest error: {0}")]
    Manifest(String),

    /// A patch history document failed to parse.
    #[error("invalid patch document: {0}")]
    PatchDocument(String),

    /// A dependency of the requested bundle failed to load.
    #[error("dependency `{0}` of `{1}` failed to load")]
    DependencyFailed(BundleName, BundleName),

    /// The transfer worker went away without delivering a result.
    #[error("transfer was interrupted")]
    TransferInterrupted,

    /// Concatenated constituent errors of an aggregate operation.
    #[error("{0}")]
    Aggregate(String),

    /// The operation was explicitly canceled.
    #[error("operation has been canceled")]
    Canceled,
}

impl Error {
    /// Whether this is the terminal cancellation error.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

/// A result type that can be used to indicate errors.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Rolling process-wide error log.
///
/// Every failed operation appends one line; the log is bounded and drops its
/// oldest entries first.
#[derive(Debug)]
pub struct ErrorLog {
    entries: VecDeque<String>,
    capacity: usize,
}

impl ErrorLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub(crate) fn push(&mut self, id: &OperationId, error: &Error) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(format!("{id}: {error}"));
    }

    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
