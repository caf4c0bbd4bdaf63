use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
};

use tracing::debug;

use crate::{
    ledger::Requester, orchestrator::CoreState, transfer::Transfer, AssetObject, AssetType,
    Bundle, BundleName, Error, Patch,
};

/// Composite identifier of an asynchronous request.
///
/// The rendered form doubles as the runtime-cache key:
/// `ab://{bundle}` for bundle fetches, `ab://{bundle}/{asset}({Type})` for
/// bundle assets, `resources://{asset}({Type})` for the built-in namespace,
/// and `{uri}({Type})` for arbitrary URIs.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct OperationId(String);

impl OperationId {
    pub fn bundle(name: &BundleName) -> Self {
        Self(format!("ab://{name}"))
    }

    pub fn asset(bundle: &BundleName, asset: &str, asset_type: &AssetType) -> Self {
        Self(format!("ab://{bundle}/{asset}({asset_type})"))
    }

    pub fn resource(asset: &str, asset_type: &AssetType) -> Self {
        Self(format!("resources://{asset}({asset_type})"))
    }

    pub fn web(uri: &str, asset_type: &AssetType) -> Self {
        Self(format!("{uri}({asset_type})"))
    }

    /// Key for a `load_asset` request: an empty bundle name routes to the
    /// web namespace when the asset looks like a URI, and to the built-in
    /// resources namespace otherwise.
    pub fn for_asset(bundle: &str, asset: &str, asset_type: &AssetType) -> Self {
        if !bundle.is_empty() {
            Self::asset(&BundleName::new(bundle), asset, asset_type)
        } else if asset.contains("://") {
            Self::web(asset, asset_type)
        } else {
            Self::resource(asset, asset_type)
        }
    }

    /// Key for a preload aggregate; aggregates are never deduplicated, so
    /// each gets a serial key.
    pub(crate) fn preload(serial: u64) -> Self {
        Self(format!("preload://{serial}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shared observable state of one operation.
///
/// Aggregate operations keep reading constituent cells after those
/// constituents completed, so the cell outlives its operation.
#[derive(Debug, Default)]
pub struct OperationStatus {
    progress: AtomicU32,
    terminal: AtomicBool,
    error: Mutex<Option<Error>>,
}

impl OperationStatus {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fractional completion in `[0, 1]`; terminal operations report 1.
    pub fn progress(&self) -> f32 {
        if self.is_terminal() {
            1.0
        } else {
            f32::from_bits(self.progress.load(Ordering::Relaxed))
        }
    }

    pub(crate) fn set_progress(&self, value: f32) {
        self.progress
            .store(value.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    /// Whether the operation reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_terminal(&self) {
        self.terminal.store(true, Ordering::Relaxed);
    }

    /// The operation's error, if it failed or was canceled.
    pub fn error(&self) -> Option<Error> {
        self.error.lock().unwrap().clone()
    }

    pub(crate) fn set_error(&self, error: Error) {
        *self.error.lock().unwrap() = Some(error);
    }
}

/// What an operation resolved to, as passed to completion callbacks.
pub struct OperationOutcome {
    pub id: OperationId,
    /// The decoded object, for asset operations that succeeded.
    pub asset: Option<Arc<AssetObject>>,
    pub error: Option<Error>,
}

/// A merged completion callback.
pub type OnComplete = Box<dyn FnOnce(&OperationOutcome) + Send>;

/// Consumer-side view of a pending or finished operation.
#[derive(Clone)]
pub struct OperationHandle {
    id: OperationId,
    status: Arc<OperationStatus>,
}

impl OperationHandle {
    pub fn id(&self) -> &OperationId {
        &self.id
    }

    pub fn progress(&self) -> f32 {
        self.status.progress()
    }

    pub fn is_done(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn error(&self) -> Option<Error> {
        self.status.error()
    }
}

/// One cancellable, pollable unit of asynchronous work.
///
/// `poll` reports whether the operation still needs polling; once it returns
/// `false` the registry finishes it exactly once, after which it is inert.
pub(crate) struct Operation {
    id: OperationId,
    status: Arc<OperationStatus>,
    callbacks: Vec<OnComplete>,
    kind: Kind,
}

pub(crate) enum Kind {
    Bundle(BundleFetch),
    Asset(AssetFetch),
    Preload(PreloadAggregate),
}

impl Operation {
    pub fn new(id: OperationId, kind: Kind) -> Self {
        Self {
            id,
            status: OperationStatus::new(),
            callbacks: Vec::new(),
            kind,
        }
    }

    pub fn id(&self) -> &OperationId {
        &self.id
    }

    pub fn status(&self) -> &Arc<OperationStatus> {
        &self.status
    }

    pub fn handle(&self) -> OperationHandle {
        OperationHandle {
            id: self.id.clone(),
            status: Arc::clone(&self.status),
        }
    }

    pub fn is_bundle_fetch(&self) -> bool {
        matches!(self.kind, Kind::Bundle(_))
    }

    pub fn add_callback(&mut self, callback: OnComplete) {
        self.callbacks.push(callback);
    }

    /// Fail the operation before it ever ran.
    pub fn with_error(mut self, error: Error) -> Self {
        self.status.set_error(error);
        self
    }

    /// Returns whether the operation still needs polling.
    pub fn poll(&mut self, state: &mut CoreState) -> bool {
        match &mut self.kind {
            Kind::Bundle(fetch) => fetch.poll(&self.status),
            Kind::Asset(fetch) => fetch.poll(&self.id, &self.status, state),
            Kind::Preload(aggregate) => aggregate.poll(&self.status),
        }
    }

    /// Run terminal side effects and fire the merged callbacks, exactly once.
    ///
    /// Dependency-release always happens before the asset-specific effects
    /// and before any callback observes the outcome.
    pub fn finish(mut self, state: &mut CoreState) {
        let asset = match &mut self.kind {
            Kind::Bundle(fetch) => {
                fetch.complete(&self.status, state);
                None
            }
            Kind::Asset(fetch) => fetch.complete(&self.id, &self.status, state),
            Kind::Preload(aggregate) => {
                aggregate.complete(&self.status);
                None
            }
        };

        self.status.set_progress(1.0);
        self.status.mark_terminal();

        let error = self.status.error();
        if let Some(error) = &error {
            state.error_log.push(&self.id, error);
        }

        let outcome = OperationOutcome {
            id: self.id,
            asset,
            error,
        };
        for callback in self.callbacks {
            callback(&outcome);
        }
    }

    /// Force immediate termination: abort transfers, release held
    /// dependencies, and suppress success callbacks.
    pub fn cancel(mut self, state: &mut CoreState) {
        debug!("canceling operation {}", self.id);

        match &mut self.kind {
            Kind::Bundle(fetch) => fetch.cancel(state),
            Kind::Asset(fetch) => fetch.cancel(&self.id, state),
            Kind::Preload(aggregate) => aggregate.cancel(),
        }

        self.status.set_error(Error::Canceled);
        self.status.mark_terminal();
        self.callbacks.clear();
    }
}

/// Fetches one bundle payload and registers the decoded handle.
pub(crate) struct BundleFetch {
    name: BundleName,
    /// Transitive dependencies this fetch registered holds for; released
    /// again if the fetch is canceled.
    held_dependencies: Vec<BundleName>,
    transfer: Option<Transfer>,
}

impl BundleFetch {
    pub fn new(name: BundleName, held_dependencies: Vec<BundleName>, transfer: Transfer) -> Self {
        Self {
            name,
            held_dependencies,
            transfer: Some(transfer),
        }
    }

    /// A fetch that failed before a transfer could start; completing it
    /// still installs the failed slot so dependents observe the error.
    pub fn failed(name: BundleName) -> Self {
        Self {
            name,
            held_dependencies: Vec::new(),
            transfer: None,
        }
    }

    fn poll(&mut self, status: &Arc<OperationStatus>) -> bool {
        if status.error().is_some() {
            return false;
        }
        match &mut self.transfer {
            Some(transfer) => {
                status.set_progress(transfer.progress());
                !transfer.poll()
            }
            None => false,
        }
    }

    fn complete(&mut self, status: &Arc<OperationStatus>, state: &mut CoreState) {
        if let Some(mut transfer) = self.transfer.take() {
            match transfer.take_outcome() {
                Ok(payload) => match Bundle::decode(&self.name, &payload) {
                    Ok(bundle) => {
                        debug!("bundle `{}` is loaded", self.name);
                        state.ledger.install(&self.name, Arc::new(bundle));
                        // Provisional seed: without a recorded dependent the
                        // bundle becomes unload-eligible right away.
                        state.ledger.add_dependency(&self.name, None);
                        return;
                    }
                    Err(error) => {
                        state.ledger.install_failed(&self.name, error.clone());
                        status.set_error(error);
                    }
                },
                Err(error) => {
                    state.ledger.install_failed(&self.name, error.clone());
                    status.set_error(error);
                }
            }
        } else if let Some(error) = status.error() {
            state.ledger.install_failed(&self.name, error);
        }
    }

    fn cancel(&mut self, state: &mut CoreState) {
        if let Some(transfer) = self.transfer.take() {
            transfer.abort();
        }
        let holder = Requester::Bundle(self.name.clone());
        for dep in &self.held_dependencies {
            state.ledger.remove_dependency(dep, &holder);
        }
    }
}

/// Where an asset payload is resolved from.
pub(crate) enum AssetSource {
    /// A currently-loading or loaded bundle.
    Bundle(BundleName),
    /// The built-in resources namespace.
    Resources,
    /// An arbitrary URI.
    Web,
}

/// Fetches one named asset and publishes the decoded object.
pub(crate) struct AssetFetch {
    source: AssetSource,
    asset: String,
    asset_type: AssetType,
    /// Bundles that must settle before extraction; the owning bundle's
    /// transitive dependency closure.
    await_bundles: Vec<BundleName>,
    transfer: Option<Transfer>,
    resolved: Option<Arc<AssetObject>>,
    /// Whether a dependency hold was registered on the owning bundle.
    holds_bundle: bool,
    /// Manifest reconciliation continuation, for patch switches.
    reconcile: Option<Patch>,
}

impl AssetFetch {
    pub fn from_bundle(
        bundle: BundleName,
        asset: impl Into<String>,
        asset_type: AssetType,
        await_bundles: Vec<BundleName>,
        holds_bundle: bool,
    ) -> Self {
        Self {
            source: AssetSource::Bundle(bundle),
            asset: asset.into(),
            asset_type,
            await_bundles,
            transfer: None,
            resolved: None,
            holds_bundle,
            reconcile: None,
        }
    }

    pub fn from_device(
        source: AssetSource,
        asset: impl Into<String>,
        asset_type: AssetType,
        transfer: Transfer,
    ) -> Self {
        Self {
            source,
            asset: asset.into(),
            asset_type,
            await_bundles: Vec::new(),
            transfer: Some(transfer),
            resolved: None,
            holds_bundle: false,
            reconcile: None,
        }
    }

    /// An operation that resolved from the runtime cache; no fetch, no hold.
    pub fn resolved(asset: impl Into<String>, asset_type: AssetType, object: Arc<AssetObject>) -> Self {
        Self {
            source: AssetSource::Resources,
            asset: asset.into(),
            asset_type,
            await_bundles: Vec::new(),
            transfer: None,
            resolved: Some(object),
            holds_bundle: false,
            reconcile: None,
        }
    }

    /// A namespace request with no device mounted for it; completes as
    /// not-found on the next tick.
    pub fn without_source(asset: impl Into<String>, asset_type: AssetType) -> Self {
        Self {
            source: AssetSource::Resources,
            asset: asset.into(),
            asset_type,
            await_bundles: Vec::new(),
            transfer: None,
            resolved: None,
            holds_bundle: false,
            reconcile: None,
        }
    }

    pub fn with_reconcile(mut self, patch: Patch) -> Self {
        self.reconcile = Some(patch);
        self
    }

    fn poll(&mut self, id: &OperationId, status: &Arc<OperationStatus>, state: &mut CoreState) -> bool {
        if status.error().is_some() || self.resolved.is_some() {
            return false;
        }

        match &self.source {
            AssetSource::Bundle(name) => {
                if let Some(error) = state.ledger.failure(name) {
                    status.set_error(error);
                    return false;
                }
                if !state.ledger.is_ready(name) {
                    return true;
                }
                // The dependency closure must settle too; a failed
                // sub-bundle poisons this load instead of hanging it.
                for dep in &self.await_bundles {
                    if state.ledger.failure(dep).is_some() {
                        status.set_error(Error::DependencyFailed(dep.clone(), name.clone()));
                        return false;
                    }
                    if !state.ledger.is_ready(dep) {
                        return true;
                    }
                }

                let bundle = state.ledger.bundle(name).expect("slot is ready");
                match bundle.get(&self.asset, &self.asset_type) {
                    Some(data) => {
                        self.resolved =
                            Some(Arc::new(AssetObject::new(self.asset_type.clone(), data)));
                        status.set_progress(1.0);
                    }
                    None => status.set_error(Error::AssetNotFound(id.clone())),
                }
                false
            }
            AssetSource::Resources | AssetSource::Web => match &mut self.transfer {
                Some(transfer) => {
                    status.set_progress(transfer.progress());
                    if !transfer.poll() {
                        return true;
                    }
                    match transfer
                        .take_outcome()
                        .and_then(|data| {
                            AssetObject::decode(self.asset_type.clone(), data, id.as_str())
                        }) {
                        Ok(object) => self.resolved = Some(Arc::new(object)),
                        Err(error) => status.set_error(error),
                    }
                    false
                }
                None => {
                    status.set_error(Error::AssetNotFound(id.clone()));
                    false
                }
            },
        }
    }

    fn complete(
        &mut self,
        id: &OperationId,
        status: &Arc<OperationStatus>,
        state: &mut CoreState,
    ) -> Option<Arc<AssetObject>> {
        // Release the hold on the owning bundle first, so callbacks observe
        // a ledger that already reflects it.
        if self.holds_bundle {
            if let AssetSource::Bundle(name) = &self.source {
                state
                    .ledger
                    .remove_dependency(name, &Requester::Operation(id.clone()));
            }
        }

        if status.error().is_none() {
            if let Some(object) = self.resolved.clone() {
                if let Some(patch) = self.reconcile.take() {
                    if let Err(error) = state.reconcile(patch, &object) {
                        status.set_error(error);
                        return None;
                    }
                }
                if self.asset_type.is_cacheable() {
                    state.runtime_cache.insert(id.clone(), Arc::clone(&object));
                }
                return Some(object);
            }
        }
        None
    }

    fn cancel(&mut self, id: &OperationId, state: &mut CoreState) {
        if self.holds_bundle {
            if let AssetSource::Bundle(name) = &self.source {
                state
                    .ledger
                    .remove_dependency(name, &Requester::Operation(id.clone()));
            }
        }
        if let Some(transfer) = self.transfer.take() {
            transfer.abort();
        }
    }
}

/// Aggregates a set of bundle fetches into one observable operation.
pub(crate) struct PreloadAggregate {
    parts: Vec<(OperationId, Arc<OperationStatus>)>,
}

impl PreloadAggregate {
    pub fn new(parts: Vec<(OperationId, Arc<OperationStatus>)>) -> Self {
        Self { parts }
    }

    fn poll(&mut self, status: &Arc<OperationStatus>) -> bool {
        if self.parts.is_empty() {
            return false;
        }

        let mut total = 0.0f32;
        let mut waiting = false;
        for (_, part) in &self.parts {
            total += part.progress();
            waiting |= !part.is_terminal();
        }
        status.set_progress(total / self.parts.len() as f32);
        waiting
    }

    fn complete(&mut self, status: &Arc<OperationStatus>) {
        let errors: Vec<String> = self
            .parts
            .iter()
            .filter_map(|(id, part)| part.error().map(|error| format!("{id}: {error}")))
            .collect();
        if !errors.is_empty() {
            status.set_error(Error::Aggregate(errors.join("\n")));
        }
    }

    fn cancel(&mut self) {
        self.parts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_ids_render_like_the_cache_keys() {
        let mesh = AssetType::new("Mesh");
        assert_eq!(
            OperationId::bundle(&BundleName::new("Level1")).as_str(),
            "ab://level1"
        );
        assert_eq!(
            OperationId::for_asset("level1", "Tree", &mesh).as_str(),
            "ab://level1/Tree(Mesh)"
        );
        assert_eq!(
            OperationId::for_asset("", "Tree", &mesh).as_str(),
            "resources://Tree(Mesh)"
        );
        assert_eq!(
            OperationId::for_asset("", "https://cdn.example.com/tree", &mesh).as_str(),
            "https://cdn.example.com/tree(Mesh)"
        );
    }

    #[test]
    fn status_reports_one_once_terminal() {
        let status = OperationStatus::new();
        status.set_progress(0.25);
        assert_eq!(status.progress(), 0.25);
        status.mark_terminal();
        assert_eq!(status.progress(), 1.0);
    }
}
