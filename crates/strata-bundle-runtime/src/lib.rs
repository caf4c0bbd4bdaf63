//! Client-side runtime for versioned, content-addressed bundles.
//!
//! The runtime fetches bundles (and the assets packed inside them) through a
//! [`strata_content_store::BundleStore`], keeps an in-process cache of
//! decoded objects, and tracks which bundles are still depended upon so that
//! nothing is unloaded while an asset load or another bundle needs it.
//!
//! All state lives in one [`CacheOrchestrator`] and is mutated only from the
//! host's tick: transfers run as tasks on the host runtime and are polled,
//! never blocked on.

mod bundle;
mod device;
mod error;
mod ledger;
mod manifest;
mod operation;
mod orchestrator;
mod patch;
mod prefs;
mod registry;
mod transfer;

pub use bundle::{AssetObject, AssetType, Bundle, BundleName};
pub use device::{Device, DirDevice, MemoryDevice};
pub use error::{Error, ErrorLog, Result};
pub use ledger::{BundleSlot, Requester};
pub use manifest::{Manifest, ManifestDiff};
pub use operation::{
    OnComplete, OperationHandle, OperationId, OperationOutcome, OperationStatus,
};
pub use orchestrator::{CacheOrchestrator, OrchestratorOptions};
pub use patch::{Patch, PatchHistory};
pub use prefs::{FilePrefs, MemoryPrefs, Prefs};

pub use strata_content_store::{BundleVersion, ContentHash};
