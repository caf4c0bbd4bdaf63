//! End-to-end behavior of the cache orchestrator: patch switches, request
//! deduplication, dependency lifetimes and cache invalidation.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use strata_bundle_runtime::{
    AssetObject, AssetType, Bundle, BundleName, CacheOrchestrator, ContentHash, Error,
    Manifest, MemoryDevice, MemoryPrefs, OperationHandle, OperationId, OrchestratorOptions,
    Patch,
};
use strata_content_store::{CachedStore, ContentCache, MemoryContentCache, MemoryContentSource};

const PLATFORM: &str = "test";

/// Shared backing stores, so several orchestrator instances can observe the
/// same source, cache and preferences (as across a process restart).
struct World {
    source: MemoryContentSource,
    cache: Arc<MemoryContentCache>,
    prefs: Arc<MemoryPrefs>,
}

impl World {
    fn new() -> Self {
        Self {
            source: MemoryContentSource::new(),
            cache: Arc::new(MemoryContentCache::new()),
            prefs: Arc::new(MemoryPrefs::new()),
        }
    }

    fn orchestrator(&self) -> CacheOrchestrator {
        OrchestratorOptions::new()
            .with_platform(PLATFORM)
            .with_store(CachedStore::new(self.source.clone(), Arc::clone(&self.cache)))
            .with_prefs(Arc::clone(&self.prefs))
            .create(tokio::runtime::Handle::current())
    }

    /// Publish a manifest bundle for `manifest` and return the patch whose
    /// commit hash pins it.
    fn publish_manifest(&self, manifest: &Manifest, comment: &str, deploy_time: i64) -> Patch {
        let mut bundle = Bundle::new();
        bundle.insert("manifest", AssetType::manifest(), manifest.to_vec());
        let payload = bundle.encode();
        let commit_hash = ContentHash::of(&payload);
        self.source.publish(PLATFORM, payload);

        Patch {
            comment: comment.to_string(),
            commit_hash,
            deploy_time,
        }
    }
}

fn mesh() -> AssetType {
    AssetType::new("Mesh")
}

/// Encode a bundle of mesh assets and return `(payload, content_hash)`.
fn mesh_bundle(assets: &[(&str, &[u8])]) -> (Vec<u8>, ContentHash) {
    let mut bundle = Bundle::new();
    for (name, data) in assets {
        bundle.insert(*name, mesh(), data.to_vec());
    }
    let payload = bundle.encode();
    let hash = ContentHash::of(&payload);
    (payload, hash)
}

async fn settle(orchestrator: &mut CacheOrchestrator, handle: &OperationHandle) {
    let mut timeout = Duration::from_millis(2000);
    let step = Duration::from_millis(5);
    while timeout > Duration::ZERO && !handle.is_done() {
        orchestrator.tick();
        tokio::time::sleep(step).await;
        timeout -= step;
    }
    assert!(
        handle.is_done(),
        "operation `{}` did not settle in time",
        handle.id()
    );
}

async fn run_ticks(orchestrator: &mut CacheOrchestrator, count: usize) {
    for _ in 0..count {
        orchestrator.tick();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A world with `shared` and `level1` (depending on `shared`), both
/// published, and the patch pointing at the manifest.
fn level_world() -> (World, Patch) {
    let world = World::new();

    let (shared_payload, shared_hash) = mesh_bundle(&[("Grass", b"grass-bytes")]);
    let (level1_payload, level1_hash) =
        mesh_bundle(&[("Tree", b"tree-bytes"), ("Rock", b"rock-bytes")]);

    let mut manifest = Manifest::new();
    manifest.insert("shared", shared_hash);
    manifest.insert("level1", level1_hash);
    manifest.set_dependencies("level1", [BundleName::new("shared")]);

    world.source.publish("shared", shared_payload);
    world.source.publish("level1", level1_payload);
    let patch = world.publish_manifest(&manifest, "level world", 100);

    (world, patch)
}

#[tokio::test]
async fn set_patch_publishes_the_manifest_and_becomes_ready() {
    let (world, patch) = level_world();
    let mut orchestrator = world.orchestrator();
    assert!(!orchestrator.ready());

    let handle = orchestrator.set_patch(patch.clone());
    settle(&mut orchestrator, &handle).await;

    assert!(handle.error().is_none(), "{:?}", handle.error());
    assert!(orchestrator.ready());
    assert_eq!(orchestrator.current_patch(), Some(&patch));

    let manifest = orchestrator.manifest().unwrap();
    assert!(manifest.contains(&BundleName::new("shared")));
    assert!(manifest.contains(&BundleName::new("level1")));

    // Only the manifest bundle itself was transferred.
    assert_eq!(world.source.fetch_count(), 1);
}

#[tokio::test]
async fn concurrent_loads_for_one_key_share_one_fetch() {
    let (world, patch) = level_world();
    let mut orchestrator = world.orchestrator();
    let handle = orchestrator.set_patch(patch);
    settle(&mut orchestrator, &handle).await;

    let results: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));

    let collect = |results: &Arc<Mutex<Vec<Vec<u8>>>>| {
        let results = Arc::clone(results);
        move |outcome: &strata_bundle_runtime::OperationOutcome| {
            let object = outcome.asset.as_ref().expect("asset resolved");
            results.lock().unwrap().push(object.data().to_vec());
        }
    };

    let first = orchestrator.load_asset_with("level1", "Tree", mesh(), collect(&results));
    let second = orchestrator.load_asset_with("level1", "Tree", mesh(), collect(&results));
    assert_eq!(first.id(), second.id());
    assert_eq!(first.id().as_str(), "ab://level1/Tree(Mesh)");

    settle(&mut orchestrator, &first).await;

    assert!(first.error().is_none(), "{:?}", first.error());
    // manifest + shared + level1; the duplicated request added nothing.
    assert_eq!(world.source.fetch_count(), 3);

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0], b"tree-bytes");
    assert_eq!(results[1], b"tree-bytes");
}

#[tokio::test]
async fn dependency_holds_track_the_level1_scenario() {
    let (world, patch) = level_world();
    let mut orchestrator = world.orchestrator();
    let handle = orchestrator.set_patch(patch);
    settle(&mut orchestrator, &handle).await;

    let load = orchestrator.load_asset("level1", "Tree", mesh());
    // Two bundle fetches plus the asset operation are pending.
    assert_eq!(orchestrator.pending_operations(), 3);
    // `shared` is held by `level1`, `level1` by the asset operation.
    assert_eq!(
        orchestrator.bundle_dependents("shared"),
        Some(vec!["bundle:level1".to_string()])
    );
    assert_eq!(
        orchestrator.bundle_dependents("level1"),
        Some(vec!["op:ab://level1/Tree(Mesh)".to_string()])
    );

    settle(&mut orchestrator, &load).await;
    assert!(load.error().is_none(), "{:?}", load.error());

    // The asset object is cached under its composite key.
    let id = OperationId::for_asset("level1", "Tree", &mesh());
    let cached = orchestrator.cached_asset(&id).expect("object cached");
    assert_eq!(cached.data(), b"tree-bytes");

    // The asset operation released its hold on `level1`; `shared` is still
    // held by `level1` until `level1` itself is drained.
    assert_eq!(
        orchestrator.bundle_dependents("shared"),
        Some(vec!["bundle:level1".to_string()])
    );

    // With nothing depending on `level1`, the next tick drains it; the
    // propagated release drains `shared` one tick later.
    run_ticks(&mut orchestrator, 1).await;
    assert!(orchestrator.bundle("level1").is_none());
    assert!(orchestrator.bundle("shared").is_some());

    run_ticks(&mut orchestrator, 1).await;
    assert!(orchestrator.bundle("shared").is_none());

    // The decoded object survives bundle unload.
    assert!(orchestrator.cached_asset(&id).is_some());
}

#[tokio::test]
async fn cached_assets_resolve_without_refetching() {
    let (world, patch) = level_world();
    let mut orchestrator = world.orchestrator();
    let handle = orchestrator.set_patch(patch);
    settle(&mut orchestrator, &handle).await;

    let first = orchestrator.load_asset("level1", "Tree", mesh());
    settle(&mut orchestrator, &first).await;
    run_ticks(&mut orchestrator, 4).await;
    assert!(orchestrator.bundle("level1").is_none());
    let fetches = world.source.fetch_count();

    let seen: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    let seen_in_callback = Arc::clone(&seen);
    let second = orchestrator.load_asset_with("level1", "Tree", mesh(), move |outcome| {
        *seen_in_callback.lock().unwrap() =
            outcome.asset.as_ref().map(|object| object.data().to_vec());
    });
    settle(&mut orchestrator, &second).await;

    assert!(second.error().is_none());
    assert_eq!(world.source.fetch_count(), fetches, "no new transfer");
    assert!(orchestrator.bundle("level1").is_none(), "no bundle reload");
    assert_eq!(seen.lock().unwrap().as_deref(), Some(&b"tree-bytes"[..]));
}

#[tokio::test]
async fn manifest_diff_purges_removed_and_changed_bundles() {
    let world = World::new();

    let (a_payload, a_hash) = mesh_bundle(&[("A", b"a-bytes")]);
    let (b_payload, b_hash) = mesh_bundle(&[("B", b"b-bytes")]);
    let (d_payload, d_hash) = mesh_bundle(&[("D", b"d-bytes")]);

    let mut old_manifest = Manifest::new();
    old_manifest.insert("a", a_hash);
    old_manifest.insert("b", b_hash);
    old_manifest.insert("d", d_hash);

    world.source.publish("a", a_payload);
    world.source.publish("b", b_payload);
    world.source.publish("d", d_payload);
    let old_patch = world.publish_manifest(&old_manifest, "old", 100);

    let mut orchestrator = world.orchestrator();
    let handle = orchestrator.set_patch(old_patch);
    settle(&mut orchestrator, &handle).await;

    let preload = orchestrator.preload();
    settle(&mut orchestrator, &preload).await;
    assert!(preload.error().is_none(), "{:?}", preload.error());
    assert!(world.cache.contains("a", &a_hash));
    assert!(world.cache.contains("b", &b_hash));
    assert!(world.cache.contains("d", &d_hash));

    // New content set: `b` is removed, `d` changed, `c` added, `a` as-is.
    let (d2_payload, d2_hash) = mesh_bundle(&[("D", b"d-bytes-v2")]);
    let (c_payload, c_hash) = mesh_bundle(&[("C", b"c-bytes")]);
    let mut new_manifest = Manifest::new();
    new_manifest.insert("a", a_hash);
    new_manifest.insert("c", c_hash);
    new_manifest.insert("d", d2_hash);
    world.source.publish("d", d2_payload);
    world.source.publish("c", c_payload);
    let new_patch = world.publish_manifest(&new_manifest, "new", 200);

    let handle = orchestrator.set_patch(new_patch);
    settle(&mut orchestrator, &handle).await;
    assert!(handle.error().is_none(), "{:?}", handle.error());

    // Removed and changed entries lost their cached payloads; the unchanged
    // entry kept its own. Nothing was fetched preemptively for `c`.
    assert!(world.cache.contains("a", &a_hash), "unchanged, untouched");
    assert!(!world.cache.contains("b", &b_hash), "removed, purged");
    assert!(!world.cache.contains("d", &d_hash), "changed, old hash purged");
    assert!(!world.cache.contains("d", &d2_hash));
    assert!(!world.cache.contains("c", &c_hash));
}

#[tokio::test]
async fn failed_manifest_fetch_keeps_the_previous_patch_active() {
    let (world, patch) = level_world();
    let mut orchestrator = world.orchestrator();
    let handle = orchestrator.set_patch(patch.clone());
    settle(&mut orchestrator, &handle).await;
    assert!(orchestrator.ready());

    // The source stops serving the manifest bundle; the next patch switch
    // must fail without unpublishing the current state.
    world.source.unpublish(PLATFORM);
    let bad_patch = Patch {
        comment: "broken".to_string(),
        commit_hash: ContentHash::of(b"something else"),
        deploy_time: 200,
    };

    let handle = orchestrator.set_patch(bad_patch);
    settle(&mut orchestrator, &handle).await;

    assert!(matches!(handle.error(), Some(Error::Transport(_))));
    assert!(orchestrator.ready());
    assert_eq!(orchestrator.current_patch(), Some(&patch));
    assert!(orchestrator.manifest().is_some());
    assert!(!orchestrator.errors().is_empty());
}

#[tokio::test]
async fn garbage_manifest_payload_is_not_published() {
    let (world, patch) = level_world();
    let mut orchestrator = world.orchestrator();
    let handle = orchestrator.set_patch(patch.clone());
    settle(&mut orchestrator, &handle).await;

    // Serve bytes that are not a bundle at all.
    world.source.publish(PLATFORM, b"not a bundle".to_vec());
    let bad_patch = Patch {
        comment: "garbage".to_string(),
        commit_hash: ContentHash::ZERO,
        deploy_time: 300,
    };

    let handle = orchestrator.set_patch(bad_patch);
    settle(&mut orchestrator, &handle).await;

    assert!(matches!(handle.error(), Some(Error::InvalidBundle(_))));
    assert_eq!(orchestrator.current_patch(), Some(&patch));
}

#[tokio::test]
async fn restore_reuses_the_materialized_manifest_without_a_transfer() {
    let (world, patch) = level_world();

    {
        let mut orchestrator = world.orchestrator();
        let handle = orchestrator.set_patch(patch.clone());
        settle(&mut orchestrator, &handle).await;
        assert_eq!(world.source.fetch_count(), 1);
    }

    // A "new process" with the same cache and prefs restores the patch from
    // the materialized manifest bundle, without touching the source.
    let mut orchestrator = world.orchestrator();
    let handle = orchestrator.restore().expect("patch is restorable");
    settle(&mut orchestrator, &handle).await;

    assert!(orchestrator.ready());
    assert_eq!(orchestrator.current_patch(), Some(&patch));
    assert_eq!(world.source.fetch_count(), 1, "restore must not refetch");
}

#[tokio::test]
async fn restore_without_materialized_manifest_purges_and_waits() {
    let (world, patch) = level_world();

    {
        let mut orchestrator = world.orchestrator();
        let handle = orchestrator.set_patch(patch);
        settle(&mut orchestrator, &handle).await;
        let preload = orchestrator.preload();
        settle(&mut orchestrator, &preload).await;
    }

    // The cache is emptied behind our back; the persisted patch is then not
    // restorable and startup must leave the facade not-ready.
    world.cache.clear();
    let (_, stray_hash) = mesh_bundle(&[("X", b"stray")]);
    world.cache.write("stray", &stray_hash, b"stray").unwrap();

    let mut orchestrator = world.orchestrator();
    assert!(orchestrator.restore().is_none());
    assert!(!orchestrator.ready());
    assert!(!world.cache.contains("stray", &stray_hash), "cache purged");
}

#[tokio::test]
async fn clear_all_is_idempotent() {
    let (world, patch) = level_world();
    let sweeps = Arc::new(Mutex::new(0usize));
    let sweeps_in_hook = Arc::clone(&sweeps);

    let mut orchestrator = OrchestratorOptions::new()
        .with_platform(PLATFORM)
        .with_store(CachedStore::new(world.source.clone(), Arc::clone(&world.cache)))
        .with_unused_asset_sweep(move || *sweeps_in_hook.lock().unwrap() += 1)
        .create(tokio::runtime::Handle::current());
    let handle = orchestrator.set_patch(patch);
    settle(&mut orchestrator, &handle).await;

    let load = orchestrator.load_asset("level1", "Tree", mesh());
    settle(&mut orchestrator, &load).await;
    let id = OperationId::for_asset("level1", "Tree", &mesh());
    assert!(orchestrator.cached_asset(&id).is_some());

    for _ in 0..2 {
        orchestrator.clear_all();

        assert!(orchestrator.cached_asset(&id).is_none());
        assert!(orchestrator.bundle("level1").is_none());
        assert!(orchestrator.bundle("shared").is_none());
        assert_eq!(orchestrator.pending_operations(), 0);
        assert!(orchestrator.errors().is_empty());
        assert!(!world.cache.contains("level1", &ContentHash::of(b"x")));
    }
    assert_eq!(*sweeps.lock().unwrap(), 2, "host sweep runs on every clear");
}

#[tokio::test]
async fn canceling_inflight_fetches_releases_dependency_holds() {
    let (world, patch) = level_world();
    let mut orchestrator = world.orchestrator();
    let handle = orchestrator.set_patch(patch);
    settle(&mut orchestrator, &handle).await;

    let load = orchestrator.load_asset("level1", "Tree", mesh());
    assert_eq!(
        orchestrator.bundle_dependents("shared"),
        Some(vec!["bundle:level1".to_string()])
    );

    orchestrator.cancel_operations();

    assert!(matches!(load.error(), Some(Error::Canceled)));
    assert_eq!(load.progress(), 1.0);
    assert_eq!(orchestrator.pending_operations(), 0);
    // Both the sub-bundle hold and the asset operation's hold are gone.
    assert!(orchestrator
        .bundle_dependents("shared")
        .map_or(true, |deps| deps.is_empty()));
    assert!(orchestrator
        .bundle_dependents("level1")
        .map_or(true, |deps| deps.is_empty()));

    let _ = world;
}

#[tokio::test]
async fn canceled_operations_never_fire_callbacks() {
    let (world, patch) = level_world();
    let mut orchestrator = world.orchestrator();
    let handle = orchestrator.set_patch(patch);
    settle(&mut orchestrator, &handle).await;

    let fired = Arc::new(Mutex::new(false));
    let fired_in_callback = Arc::clone(&fired);
    let _load = orchestrator.load_asset_with("level1", "Tree", mesh(), move |_| {
        *fired_in_callback.lock().unwrap() = true;
    });

    orchestrator.cancel_operations();
    run_ticks(&mut orchestrator, 2).await;

    assert!(!*fired.lock().unwrap());
    let _ = world;
}

#[tokio::test]
async fn failed_dependency_poisons_the_asset_load() {
    let world = World::new();

    let (level1_payload, level1_hash) = mesh_bundle(&[("Tree", b"tree-bytes")]);
    let (_, shared_hash) = mesh_bundle(&[("Grass", b"grass")]);

    let mut manifest = Manifest::new();
    manifest.insert("level1", level1_hash);
    manifest.insert("shared", shared_hash);
    manifest.set_dependencies("level1", [BundleName::new("shared")]);

    // `shared` is deliberately never published.
    world.source.publish("level1", level1_payload);
    let patch = world.publish_manifest(&manifest, "broken deps", 100);

    let mut orchestrator = world.orchestrator();
    let handle = orchestrator.set_patch(patch);
    settle(&mut orchestrator, &handle).await;

    let load = orchestrator.load_asset("level1", "Tree", mesh());
    settle(&mut orchestrator, &load).await;

    assert!(matches!(load.error(), Some(Error::DependencyFailed(_, _))));
    assert!(!orchestrator.errors().is_empty());
}

#[tokio::test]
async fn missing_assets_and_unknown_bundles_fail_cleanly() {
    let (world, patch) = level_world();
    let mut orchestrator = world.orchestrator();
    let handle = orchestrator.set_patch(patch);
    settle(&mut orchestrator, &handle).await;

    let missing_asset = orchestrator.load_asset("level1", "Bush", mesh());
    settle(&mut orchestrator, &missing_asset).await;
    assert!(matches!(
        missing_asset.error(),
        Some(Error::AssetNotFound(_))
    ));

    let unknown_bundle = orchestrator.load_asset("level99", "Tree", mesh());
    settle(&mut orchestrator, &unknown_bundle).await;
    assert!(matches!(
        unknown_bundle.error(),
        Some(Error::BundleNotInManifest(_))
    ));

    let _ = world;
}

#[tokio::test]
async fn preload_fetches_only_uncached_bundles_and_aggregates_errors() {
    let world = World::new();

    let (a_payload, a_hash) = mesh_bundle(&[("A", b"a-bytes")]);
    let (_, missing_hash) = mesh_bundle(&[("M", b"missing")]);

    let mut manifest = Manifest::new();
    manifest.insert("a", a_hash);
    manifest.insert("missing", missing_hash);
    world.source.publish("a", a_payload);
    let patch = world.publish_manifest(&manifest, "preload world", 100);

    let mut orchestrator = world.orchestrator();
    let handle = orchestrator.set_patch(patch);
    settle(&mut orchestrator, &handle).await;

    let preload = orchestrator.preload();
    settle(&mut orchestrator, &preload).await;

    // The unpublished bundle's failure is aggregated; the other one landed.
    match preload.error() {
        Some(Error::Aggregate(message)) => {
            assert!(message.contains("ab://missing"), "{message}");
            assert!(!message.contains("ab://a("), "{message}");
        }
        other => panic!("expected aggregate error, got {other:?}"),
    }
    assert!(world.cache.contains("a", &a_hash));

    // Everything obtainable is materialized now: a fresh preload is a no-op.
    let fetches = world.source.fetch_count();
    let again = orchestrator.preload_where(|name| name.as_str() == "a");
    settle(&mut orchestrator, &again).await;
    assert!(again.error().is_none());
    assert_eq!(again.progress(), 1.0);
    assert_eq!(world.source.fetch_count(), fetches);
}

#[tokio::test]
async fn preload_before_any_patch_fails_with_manifest_not_set() {
    let world = World::new();
    let mut orchestrator = world.orchestrator();

    let preload = orchestrator.preload();
    settle(&mut orchestrator, &preload).await;
    assert!(matches!(preload.error(), Some(Error::ManifestNotSet)));
}

#[tokio::test]
async fn device_namespaces_resolve_and_respect_caching_policy() {
    let (world, patch) = level_world();

    let resources = MemoryDevice::new();
    resources.insert("icons/save", b"icon-bytes".to_vec());
    resources.insert("notes/readme", b"readme text".to_vec());
    let web = MemoryDevice::new();
    web.insert("https://cdn.example.com/banner", b"banner-bytes".to_vec());

    let mut orchestrator = OrchestratorOptions::new()
        .with_platform(PLATFORM)
        .with_store(CachedStore::new(world.source.clone(), Arc::clone(&world.cache)))
        .with_resources_device(resources)
        .with_web_device(web)
        .create(tokio::runtime::Handle::current());
    let handle = orchestrator.set_patch(patch);
    settle(&mut orchestrator, &handle).await;

    // Built-in resources namespace.
    let icon_type = AssetType::new("Icon");
    let icon = orchestrator.load_asset("", "icons/save", icon_type.clone());
    assert_eq!(icon.id().as_str(), "resources://icons/save(Icon)");
    settle(&mut orchestrator, &icon).await;
    assert!(icon.error().is_none());
    assert!(orchestrator
        .cached_asset(&OperationId::for_asset("", "icons/save", &icon_type))
        .is_some());

    // Arbitrary-URI namespace.
    let banner = orchestrator.load_asset("", "https://cdn.example.com/banner", icon_type.clone());
    assert_eq!(
        banner.id().as_str(),
        "https://cdn.example.com/banner(Icon)"
    );
    settle(&mut orchestrator, &banner).await;
    assert!(banner.error().is_none());

    // Plain-text wrapper objects resolve but are excluded from the cache.
    let text = orchestrator.load_asset("", "notes/readme", AssetType::plain_text());
    settle(&mut orchestrator, &text).await;
    assert!(text.error().is_none());
    assert!(orchestrator
        .cached_asset(&OperationId::for_asset(
            "",
            "notes/readme",
            &AssetType::plain_text()
        ))
        .is_none());

    // A namespace with no device mounted resolves to not-found.
    let mut bare = world.orchestrator();
    let orphan = bare.load_asset("", "icons/save", icon_type);
    settle(&mut bare, &orphan).await;
    assert!(matches!(orphan.error(), Some(Error::AssetNotFound(_))));
}

#[tokio::test]
async fn runtime_cache_clearing_variants() {
    let (world, patch) = level_world();
    let mut orchestrator = world.orchestrator();
    let handle = orchestrator.set_patch(patch);
    settle(&mut orchestrator, &handle).await;

    let tree = orchestrator.load_asset("level1", "Tree", mesh());
    let rock = orchestrator.load_asset("level1", "Rock", mesh());
    settle(&mut orchestrator, &tree).await;
    settle(&mut orchestrator, &rock).await;

    let tree_id = OperationId::for_asset("level1", "Tree", &mesh());
    let rock_id = OperationId::for_asset("level1", "Rock", &mesh());
    assert!(orchestrator.cached_asset(&tree_id).is_some());
    assert!(orchestrator.cached_asset(&rock_id).is_some());

    orchestrator.clear_runtime_cache_ids(std::slice::from_ref(&tree_id));
    assert!(orchestrator.cached_asset(&tree_id).is_none());
    assert!(orchestrator.cached_asset(&rock_id).is_some());

    orchestrator.clear_runtime_cache_where(|id, _| id.as_str().contains("Rock"));
    assert!(orchestrator.cached_asset(&rock_id).is_none());
}

#[tokio::test]
async fn resident_bundles_survive_having_no_dependents() {
    let world = World::new();

    let (ui_payload, ui_hash) = mesh_bundle(&[("Font", b"font-bytes")]);
    let mut manifest = Manifest::new();
    manifest.insert("ui_fonts", ui_hash);
    world.source.publish("ui_fonts", ui_payload);
    let patch = world.publish_manifest(&manifest, "ui", 100);

    let mut orchestrator = OrchestratorOptions::new()
        .with_platform(PLATFORM)
        .with_store(CachedStore::new(world.source.clone(), Arc::clone(&world.cache)))
        .with_resident_prefix("ui_")
        .create(tokio::runtime::Handle::current());
    let handle = orchestrator.set_patch(patch);
    settle(&mut orchestrator, &handle).await;

    let load = orchestrator.load_asset("ui_fonts", "Font", mesh());
    settle(&mut orchestrator, &load).await;
    assert!(load.error().is_none());

    // Many ticks later the resident bundle is still loaded.
    run_ticks(&mut orchestrator, 6).await;
    assert!(orchestrator.bundle("ui_fonts").is_some());
}

#[tokio::test]
async fn text_assets_expose_their_payload_as_text() {
    let world = World::new();

    let device = MemoryDevice::new();
    device.insert("motd", "bienvenue".as_bytes().to_vec());

    let mut orchestrator = OrchestratorOptions::new()
        .with_platform(PLATFORM)
        .with_store(CachedStore::new(world.source.clone(), Arc::clone(&world.cache)))
        .with_resources_device(device)
        .create(tokio::runtime::Handle::current());

    let seen: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let seen_in_callback = Arc::clone(&seen);
    let load = orchestrator.load_asset_with(
        "",
        "motd",
        AssetType::plain_text(),
        move |outcome| {
            let text = outcome
                .asset
                .as_ref()
                .and_then(|object: &Arc<AssetObject>| object.as_text().map(str::to_string));
            *seen_in_callback.lock().unwrap() = text;
        },
    );
    settle(&mut orchestrator, &load).await;

    assert_eq!(seen.lock().unwrap().as_deref(), Some("bienvenue"));
}
