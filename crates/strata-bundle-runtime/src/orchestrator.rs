use std::{collections::HashMap, sync::Arc};

use strata_content_store::{
    BundleStore, BundleVersion, CachedStore, ContentHash, MemoryContentCache, MemoryContentSource,
};
use tracing::{debug, info, warn};

use crate::{
    ledger::{DependencyLedger, Requester},
    operation::{AssetFetch, AssetSource, BundleFetch, Kind, Operation, PreloadAggregate},
    registry::OperationRegistry,
    transfer::Transfer,
    AssetObject, AssetType, Bundle, BundleName, Device, Error, ErrorLog, Manifest, MemoryPrefs,
    OnComplete, OperationHandle, OperationId, Patch, Prefs, Result,
};

/// Preferences key under which the serialized last-used patch is persisted.
const LAST_PATCH_KEY: &str = "strata.last_patch";

/// The asset inside the manifest bundle that carries the manifest document.
const MANIFEST_ASSET_NAME: &str = "manifest";

fn default_platform() -> &'static str {
    if cfg!(target_os = "windows") {
        "Windows"
    } else if cfg!(target_os = "macos") {
        "OSX"
    } else if cfg!(target_os = "linux") {
        "Linux"
    } else if cfg!(target_os = "android") {
        "Android"
    } else if cfg!(target_os = "ios") {
        "iOS"
    } else {
        "Unknown"
    }
}

type SweepFn = Box<dyn Fn() + Send + Sync>;

/// Everything the operations mutate on completion. Owned by the
/// orchestrator and only ever touched from the tick thread.
pub(crate) struct CoreState {
    pub store: Arc<dyn BundleStore>,
    pub resources: Option<Arc<dyn Device>>,
    pub web: Option<Arc<dyn Device>>,
    pub prefs: Box<dyn Prefs>,
    pub io: tokio::runtime::Handle,
    pub platform: BundleName,
    pub manifest: Option<Arc<Manifest>>,
    pub patch: Option<Patch>,
    pub ledger: DependencyLedger,
    pub runtime_cache: HashMap<OperationId, Arc<AssetObject>>,
    pub error_log: ErrorLog,
    pub ready: bool,
    next_preload_id: u64,
    unused_sweep: Option<SweepFn>,
}

impl CoreState {
    /// Publish a freshly fetched manifest: diff against the previous one,
    /// purge stale cache entries, persist the patch pointer.
    ///
    /// On failure the previous manifest and patch stay authoritative.
    pub fn reconcile(&mut self, patch: Patch, payload: &AssetObject) -> Result<()> {
        let new_manifest = Manifest::from_slice(payload.data())?;

        match &self.manifest {
            Some(old) => {
                let diff = Manifest::diff(old, &new_manifest);
                for (name, old_hash) in diff.purge_targets() {
                    debug!("purging stale bundle `{name}` ({old_hash})");
                    self.store.purge(name.as_str(), old_hash);
                }
                info!(
                    "manifest reconciled: {} added, {} removed, {} changed",
                    diff.added.len(),
                    diff.removed.len(),
                    diff.changed.len()
                );
            }
            None => {
                info!("first manifest: {} bundles newly seen", new_manifest.len());
            }
        }

        self.manifest = Some(Arc::new(new_manifest));
        match serde_json::to_string(&patch) {
            Ok(serialized) => self.prefs.set(LAST_PATCH_KEY, &serialized),
            Err(err) => warn!("failed to serialize patch pointer: {err}"),
        }
        self.patch = Some(patch);
        self.ready = true;
        Ok(())
    }
}

/// Options which can be used to configure the creation of a
/// [`CacheOrchestrator`].
pub struct OrchestratorOptions {
    store: Option<Arc<dyn BundleStore>>,
    resources: Option<Arc<dyn Device>>,
    web: Option<Arc<dyn Device>>,
    prefs: Box<dyn Prefs>,
    platform: BundleName,
    resident_prefixes: Vec<String>,
    error_log_capacity: usize,
    unused_sweep: Option<SweepFn>,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorOptions {
    /// Creates a blank set of options.
    pub fn new() -> Self {
        Self {
            store: None,
            resources: None,
            web: None,
            prefs: Box::new(MemoryPrefs::new()),
            platform: BundleName::new(default_platform()),
            resident_prefixes: Vec::new(),
            error_log_capacity: 64,
            unused_sweep: None,
        }
    }

    /// The bundle store content is pulled from and purged against. Defaults
    /// to a memory-backed store, which is only useful in tests.
    #[must_use]
    pub fn with_store(mut self, store: impl BundleStore + 'static) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    /// Mount the built-in resources namespace.
    #[must_use]
    pub fn with_resources_device(mut self, device: impl Device + 'static) -> Self {
        self.resources = Some(Arc::new(device));
        self
    }

    /// Mount the arbitrary-URI namespace.
    #[must_use]
    pub fn with_web_device(mut self, device: impl Device + 'static) -> Self {
        self.web = Some(Arc::new(device));
        self
    }

    /// The persisted patch pointer store. Defaults to in-memory preferences.
    #[must_use]
    pub fn with_prefs(mut self, prefs: impl Prefs + 'static) -> Self {
        self.prefs = Box::new(prefs);
        self
    }

    /// The name of the manifest bundle. Defaults to the platform identifier.
    #[must_use]
    pub fn with_platform(mut self, platform: impl Into<BundleName>) -> Self {
        self.platform = platform.into();
        self
    }

    /// Bundles whose name starts with `prefix` stay resident: they never
    /// become unload-eligible.
    #[must_use]
    pub fn with_resident_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.resident_prefixes.push(prefix.into());
        self
    }

    #[must_use]
    pub fn with_error_log_capacity(mut self, capacity: usize) -> Self {
        self.error_log_capacity = capacity;
        self
    }

    /// Host hook invoked by `clear_all` to sweep unused host-side assets.
    #[must_use]
    pub fn with_unused_asset_sweep(mut self, sweep: impl Fn() + Send + Sync + 'static) -> Self {
        self.unused_sweep = Some(Box::new(sweep));
        self
    }

    /// Creates a [`CacheOrchestrator`] based on the options. Transfers are
    /// spawned on `io`, which the host drives.
    pub fn create(self, io: tokio::runtime::Handle) -> CacheOrchestrator {
        let store = self.store.unwrap_or_else(|| {
            Arc::new(CachedStore::new(
                MemoryContentSource::new(),
                MemoryContentCache::new(),
            ))
        });

        CacheOrchestrator {
            state: CoreState {
                store,
                resources: self.resources,
                web: self.web,
                prefs: self.prefs,
                io,
                platform: self.platform,
                manifest: None,
                patch: None,
                ledger: DependencyLedger::new(self.resident_prefixes),
                runtime_cache: HashMap::new(),
                error_log: ErrorLog::new(self.error_log_capacity),
                ready: false,
                next_preload_id: 0,
                unused_sweep: self.unused_sweep,
            },
            registry: OperationRegistry::default(),
        }
    }
}

/// The bundle/asset cache facade.
///
/// One explicit context object owns every map: the dependency ledger, the
/// operation registry, the runtime cache and the active manifest. All
/// mutation happens on the thread that calls [`CacheOrchestrator::tick`];
/// transfers themselves run as host tasks and are only ever polled.
pub struct CacheOrchestrator {
    state: CoreState,
    registry: OperationRegistry,
}

impl CacheOrchestrator {
    /// Drive one tick: poll every pending operation (completions fire in
    /// registration order), then drain the unload-eligible bundles.
    pub fn tick(&mut self) {
        let mut registry = std::mem::take(&mut self.registry);
        registry.tick(&mut self.state);
        self.registry = registry;

        let manifest = self.state.manifest.clone();
        let drained = self.state.ledger.drain_unloadable(manifest.as_deref());
        if !drained.is_empty() {
            debug!("drained {} unloadable bundle(s)", drained.len());
        }
    }

    /// Whether startup reconciliation has published a manifest. Until then,
    /// `load_asset` and `preload` have no manifest to resolve against.
    pub fn ready(&self) -> bool {
        self.state.ready
    }

    /// Restore the last used patch.
    ///
    /// If a persisted patch exists and its manifest bundle is materialized
    /// locally, reconciliation is started from the cache without a network
    /// fetch. Otherwise the entire local bundle cache is purged and the
    /// facade stays not-ready until an explicit [`Self::set_patch`].
    pub fn restore(&mut self) -> Option<OperationHandle> {
        let patch: Option<Patch> = self
            .state
            .prefs
            .get(LAST_PATCH_KEY)
            .and_then(|raw| serde_json::from_str(&raw).ok());

        match patch {
            Some(patch) => {
                let materialized = patch.bundle_version().cache_key().map_or(false, |hash| {
                    self.state.store.contains(self.state.platform.as_str(), hash)
                });
                if materialized {
                    info!("restoring last used patch `{}`", patch.comment);
                    Some(self.set_patch(patch))
                } else {
                    info!("last used patch is not materialized locally; purging cache");
                    self.state.store.purge_all();
                    None
                }
            }
            None => {
                debug!("no last used patch; waiting for an explicit set_patch");
                self.state.store.purge_all();
                None
            }
        }
    }

    /// Switch the active content set to `patch`.
    ///
    /// In-flight work belonging to the previous patch is fully reset first;
    /// the new manifest is then fetched, diffed against the old one and
    /// stale cache entries are purged. On failure the previous manifest and
    /// patch remain authoritative.
    pub fn set_patch(&mut self, patch: Patch) -> OperationHandle {
        info!(
            "switching to patch `{}` ({})",
            patch.comment, patch.commit_hash
        );

        // Full reset: nothing from the previous patch may leak into the new
        // one.
        self.clear_runtime_cache_all();
        self.cancel_operations();
        self.state.ledger.unload_all();

        let platform = self.state.platform.clone();
        self.request_bundle(&platform, true, Some(&patch));

        let id = OperationId::asset(&platform, MANIFEST_ASSET_NAME, &AssetType::manifest());
        self.state
            .ledger
            .add_dependency(&platform, Some(Requester::Operation(id.clone())));
        let fetch = AssetFetch::from_bundle(
            platform,
            MANIFEST_ASSET_NAME,
            AssetType::manifest(),
            Vec::new(),
            true,
        )
        .with_reconcile(patch);
        self.registry.push(Operation::new(id, Kind::Asset(fetch)))
    }

    /// Start bundle fetches for every bundle in the active manifest that is
    /// not already materialized locally, and return an aggregate operation
    /// over all pending bundle fetches.
    pub fn preload(&mut self) -> OperationHandle {
        self.preload_where(|_| true)
    }

    /// Like [`Self::preload`], restricted to bundle names matching
    /// `predicate`.
    pub fn preload_where(&mut self, predicate: impl Fn(&BundleName) -> bool) -> OperationHandle {
        let id = OperationId::preload(self.state.next_preload_id);
        self.state.next_preload_id += 1;

        let Some(manifest) = self.state.manifest.clone() else {
            let operation = Operation::new(id, Kind::Preload(PreloadAggregate::new(Vec::new())))
                .with_error(Error::ManifestNotSet);
            return self.registry.push(operation);
        };

        for name in manifest.bundle_names() {
            if !predicate(name) {
                continue;
            }
            let hash = manifest.hash_of(name).expect("name comes from the manifest");
            if !self.state.store.contains(name.as_str(), &hash) {
                self.request_bundle(name, false, None);
            }
        }

        let parts = self.registry.pending_bundle_fetches();
        debug!("preloading over {} pending bundle fetch(es)", parts.len());
        self.registry
            .push(Operation::new(id, Kind::Preload(PreloadAggregate::new(parts))))
    }

    /// Start a load for a named asset.
    ///
    /// A non-empty `bundle` resolves from that bundle, fetching it and its
    /// transitive dependencies as needed. With an empty `bundle`, asset
    /// names containing `://` resolve from the web namespace and everything
    /// else from the built-in resources namespace.
    ///
    /// Concurrent requests for the same `(bundle, asset, type)` key share
    /// one underlying operation.
    pub fn load_asset(&mut self, bundle: &str, asset: &str, asset_type: AssetType) -> OperationHandle {
        self.load_asset_impl(bundle, asset, asset_type, None)
    }

    /// Like [`Self::load_asset`], with a completion callback. Callbacks
    /// merged onto an already-pending operation all fire with the same
    /// outcome.
    pub fn load_asset_with(
        &mut self,
        bundle: &str,
        asset: &str,
        asset_type: AssetType,
        callback: impl FnOnce(&crate::OperationOutcome) + Send + 'static,
    ) -> OperationHandle {
        self.load_asset_impl(bundle, asset, asset_type, Some(Box::new(callback)))
    }

    fn load_asset_impl(
        &mut self,
        bundle: &str,
        asset: &str,
        asset_type: AssetType,
        callback: Option<OnComplete>,
    ) -> OperationHandle {
        let id = OperationId::for_asset(bundle, asset, &asset_type);
        let cached = self.state.runtime_cache.get(&id).cloned();

        // Not cached yet: the owning bundle (and its dependency closure)
        // must be on its way in. Manifest loads are exempt from the
        // active-manifest requirement.
        if !bundle.is_empty() && cached.is_none() {
            let name = BundleName::new(bundle);
            let manifest_bundle = asset_type == AssetType::manifest();
            let patch = self.state.patch.clone();
            self.request_bundle(
                &name,
                manifest_bundle,
                if manifest_bundle { patch.as_ref() } else { None },
            );
        }

        // Merge into a pending operation for the same key, if any.
        if let Some(operation) = self.registry.find_mut(&id) {
            if let Some(callback) = callback {
                operation.add_callback(callback);
            }
            return operation.handle();
        }

        let kind = self.make_asset_kind(&id, bundle, asset, asset_type, cached);
        let mut operation = Operation::new(id, kind);
        if let Some(callback) = callback {
            operation.add_callback(callback);
        }
        self.registry.push(operation)
    }

    fn make_asset_kind(
        &mut self,
        id: &OperationId,
        bundle: &str,
        asset: &str,
        asset_type: AssetType,
        cached: Option<Arc<AssetObject>>,
    ) -> Kind {
        if let Some(object) = cached {
            return Kind::Asset(AssetFetch::resolved(asset, asset_type, object));
        }

        if !bundle.is_empty() {
            let name = BundleName::new(bundle);
            // The hold is registered before the fetch can possibly
            // complete, closing the window where the bundle could drain
            // under an outstanding load.
            self.state
                .ledger
                .add_dependency(&name, Some(Requester::Operation(id.clone())));
            let await_bundles = self
                .state
                .manifest
                .as_ref()
                .map(|manifest| manifest.transitive_dependencies(&name))
                .unwrap_or_default();
            return Kind::Asset(AssetFetch::from_bundle(
                name,
                asset,
                asset_type,
                await_bundles,
                true,
            ));
        }

        let (source, device) = if asset.contains("://") {
            (AssetSource::Web, self.state.web.clone())
        } else {
            (AssetSource::Resources, self.state.resources.clone())
        };
        match device {
            Some(device) => {
                let transfer = Transfer::spawn_device(
                    &self.state.io,
                    device,
                    asset.to_string(),
                    id.clone(),
                );
                Kind::Asset(AssetFetch::from_device(source, asset, asset_type, transfer))
            }
            None => Kind::Asset(AssetFetch::without_source(asset, asset_type)),
        }
    }

    /// Start the fetch of a bundle and of every transitive dependency,
    /// registering the dependency holds before the dependency fetches are
    /// issued. Manifest bundle fetches are exempt from the active-manifest
    /// requirement and version against `patch` instead.
    fn request_bundle(&mut self, name: &BundleName, manifest_bundle: bool, patch: Option<&Patch>) {
        if !manifest_bundle && self.state.manifest.is_none() {
            warn!("cannot load bundle `{name}`: no manifest is active");
            return;
        }

        let dependencies: Vec<BundleName> = self
            .state
            .manifest
            .as_ref()
            .map(|manifest| manifest.transitive_dependencies(name))
            .unwrap_or_default();

        for dependency in &dependencies {
            self.state
                .ledger
                .add_dependency(dependency, Some(Requester::Bundle(name.clone())));
        }

        self.request_bundle_fetch(name, manifest_bundle, patch, dependencies.clone());
        for dependency in &dependencies {
            self.request_bundle_fetch(dependency, false, None, Vec::new());
        }
    }

    /// Register the transfer for one bundle, unless it is already loaded or
    /// already in flight.
    fn request_bundle_fetch(
        &mut self,
        name: &BundleName,
        manifest_bundle: bool,
        patch: Option<&Patch>,
        held_dependencies: Vec<BundleName>,
    ) {
        if self.state.ledger.is_ready(name) {
            return;
        }
        // A previous failure is forgotten on re-request.
        self.state.ledger.clear_failure(name);

        let id = OperationId::bundle(name);
        if self.registry.contains(&id) {
            return;
        }

        let version = if manifest_bundle {
            match patch {
                Some(patch) if !patch.commit_hash.is_sentinel() => {
                    BundleVersion::Pinned(patch.commit_hash)
                }
                // A sentinel commit hash forces the download; before any
                // patch was ever restored there is nothing to pin to either.
                Some(_) => BundleVersion::ForceDownload,
                None => BundleVersion::NoPatch,
            }
        } else {
            match self
                .state
                .manifest
                .as_ref()
                .and_then(|manifest| manifest.hash_of(name))
            {
                Some(hash) => BundleVersion::from(hash),
                None => {
                    let operation =
                        Operation::new(id, Kind::Bundle(BundleFetch::failed(name.clone())))
                            .with_error(Error::BundleNotInManifest(name.clone()));
                    self.registry.push(operation);
                    return;
                }
            }
        };

        debug!("fetching bundle `{name}` at {version:?}");
        let transfer = Transfer::spawn_pull(
            &self.state.io,
            Arc::clone(&self.state.store),
            name.clone(),
            version,
        );
        let operation = Operation::new(
            id,
            Kind::Bundle(BundleFetch::new(name.clone(), held_dependencies, transfer)),
        );
        self.registry.push(operation);
    }

    /// The live handle for a previously requested bundle, when loaded.
    pub fn bundle(&self, name: &str) -> Option<Arc<Bundle>> {
        self.state.ledger.bundle(&BundleName::new(name))
    }

    /// The identifiers currently holding `name` loaded, rendered for
    /// inspection; `None` when nothing depends on it.
    pub fn bundle_dependents(&self, name: &str) -> Option<Vec<String>> {
        self.state
            .ledger
            .dependents(&BundleName::new(name))
            .map(|requesters| {
                let mut out: Vec<String> =
                    requesters.iter().map(ToString::to_string).collect();
                out.sort();
                out
            })
    }

    /// The cached decoded object for an operation key, if any.
    pub fn cached_asset(&self, id: &OperationId) -> Option<Arc<AssetObject>> {
        self.state.runtime_cache.get(id).cloned()
    }

    /// The active manifest, once reconciliation published one.
    pub fn manifest(&self) -> Option<Arc<Manifest>> {
        self.state.manifest.clone()
    }

    /// The active patch, once reconciliation published one.
    pub fn current_patch(&self) -> Option<&Patch> {
        self.state.patch.as_ref()
    }

    /// Lines of the rolling error log, oldest first.
    pub fn errors(&self) -> Vec<String> {
        self.state.error_log.entries().map(str::to_string).collect()
    }

    pub fn pending_operations(&self) -> usize {
        self.registry.len()
    }

    /// Clear the whole runtime cache.
    pub fn clear_runtime_cache_all(&mut self) {
        self.state.runtime_cache.clear();
    }

    /// Drop runtime-cache entries matching `predicate`.
    pub fn clear_runtime_cache_where(
        &mut self,
        predicate: impl Fn(&OperationId, &AssetObject) -> bool,
    ) {
        self.state
            .runtime_cache
            .retain(|id, object| !predicate(id, object.as_ref()));
    }

    /// Drop the runtime-cache entries for the given keys.
    pub fn clear_runtime_cache_ids(&mut self, ids: &[OperationId]) {
        for id in ids {
            self.state.runtime_cache.remove(id);
        }
    }

    /// Cancel every pending operation. Canceled operations release their
    /// dependency holds but never fire success callbacks.
    pub fn cancel_operations(&mut self) {
        let mut registry = std::mem::take(&mut self.registry);
        registry.cancel_all(&mut self.state);
        self.registry = registry;
    }

    /// Release every loaded bundle immediately.
    pub fn unload_bundles_all(&mut self) {
        self.state.ledger.unload_all();
    }

    /// Unload one bundle and drop its local cache entry, so the next fetch
    /// is forced through the source.
    pub fn clear_cached_bundle(&mut self, name: &str, hash: &ContentHash) {
        let name = BundleName::new(name);
        self.state.ledger.unload_one(&name);
        self.state.store.purge(name.as_str(), hash);
    }

    /// Drop every local cache entry, and unload every bundle the active
    /// manifest knows about.
    pub fn clear_cached_bundle_all(&mut self) {
        self.state.store.purge_all();
        if let Some(manifest) = self.state.manifest.clone() {
            for name in manifest.bundle_names() {
                self.state.ledger.unload_one(name);
            }
        }
    }

    /// Full reset: runtime cache, pending operations, loaded bundles, local
    /// bundle cache, error log, plus the host-level unused-asset sweep when
    /// one is configured. Idempotent.
    pub fn clear_all(&mut self) {
        self.state.error_log.clear();
        self.clear_runtime_cache_all();
        self.cancel_operations();
        self.state.ledger.unload_all();
        self.state.store.purge_all();
        if let Some(sweep) = &self.state.unused_sweep {
            sweep();
        }
    }
}
