use std::collections::{BTreeMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use strata_content_store::ContentHash;

use crate::{BundleName, Error, Result};

/// The description of a full content set: bundle name to version fingerprint,
/// and bundle name to direct dependencies.
///
/// A manifest is immutable once published; the active manifest is replaced
/// atomically on patch change. Dependency graphs may contain diamonds but no
/// self-cycles.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    bundles: BTreeMap<BundleName, ContentHash>,
    #[serde(default)]
    dependencies: BTreeMap<BundleName, Vec<BundleName>>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a manifest payload.
    ///
    /// # Errors
    ///
    /// Returns `Error::Manifest` when the payload does not parse.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|err| Error::Manifest(err.to_string()))
    }

    pub fn to_vec(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("manifest serialization is infallible")
    }

    pub fn insert(&mut self, name: impl Into<BundleName>, hash: ContentHash) {
        self.bundles.insert(name.into(), hash);
    }

    pub fn set_dependencies(
        &mut self,
        name: impl Into<BundleName>,
        dependencies: impl IntoIterator<Item = BundleName>,
    ) {
        self.dependencies
            .insert(name.into(), dependencies.into_iter().collect());
    }

    pub fn contains(&self, name: &BundleName) -> bool {
        self.bundles.contains_key(name)
    }

    pub fn hash_of(&self, name: &BundleName) -> Option<ContentHash> {
        self.bundles.get(name).copied()
    }

    pub fn bundle_names(&self) -> impl Iterator<Item = &BundleName> {
        self.bundles.keys()
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    /// The declared direct dependencies of `name`.
    pub fn direct_dependencies(&self, name: &BundleName) -> &[BundleName] {
        self.dependencies
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Every bundle reachable from `name` through the dependency graph,
    /// excluding `name` itself. Diamond dependencies are visited once.
    pub fn transitive_dependencies(&self, name: &BundleName) -> Vec<BundleName> {
        let mut visited: HashSet<&BundleName> = HashSet::new();
        let mut queue: VecDeque<&BundleName> = self.direct_dependencies(name).iter().collect();
        let mut out = Vec::new();

        while let Some(dep) = queue.pop_front() {
            if dep == name || !visited.insert(dep) {
                continue;
            }
            out.push(dep.clone());
            queue.extend(self.direct_dependencies(dep));
        }
        out
    }

    /// Compare an old manifest against a new one over the bundle-name
    /// universe.
    pub fn diff(old: &Self, new: &Self) -> ManifestDiff {
        let mut diff = ManifestDiff::default();

        for (name, new_hash) in &new.bundles {
            if !old.bundles.contains_key(name) {
                diff.added.push(name.clone());
            } else if old.bundles[name] != *new_hash {
                // Purge targets carry the *old* fingerprint; the new one is
                // fetched lazily.
                diff.changed.push((name.clone(), old.bundles[name]));
            }
        }
        for (name, old_hash) in &old.bundles {
            if !new.bundles.contains_key(name) {
                diff.removed.push((name.clone(), *old_hash));
            }
        }
        diff
    }
}

/// The outcome of reconciling two manifests.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ManifestDiff {
    /// Names present only in the new manifest. Nothing is cached for them
    /// yet, so no action is needed.
    pub added: Vec<BundleName>,
    /// Names dropped by the new manifest, with their last known fingerprint.
    pub removed: Vec<(BundleName, ContentHash)>,
    /// Names present in both with a different fingerprint; the hash is the
    /// old one, whose cache entry must be purged.
    pub changed: Vec<(BundleName, ContentHash)>,
}

impl ManifestDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    /// Every `(name, old-hash)` cache entry the reconciler must purge.
    pub fn purge_targets(&self) -> impl Iterator<Item = &(BundleName, ContentHash)> {
        self.removed.iter().chain(self.changed.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(tag: &str) -> ContentHash {
        ContentHash::of(tag.as_bytes())
    }

    fn manifest(entries: &[(&str, &str)]) -> Manifest {
        let mut m = Manifest::new();
        for (name, tag) in entries {
            m.insert(*name, hash(tag));
        }
        m
    }

    #[test]
    fn diff_classifies_added_removed_changed() {
        let old = manifest(&[("a", "h1"), ("b", "h2")]);
        let new = manifest(&[("a", "h1"), ("c", "h3")]);

        let diff = Manifest::diff(&old, &new);
        assert_eq!(diff.added, vec![BundleName::new("c")]);
        assert_eq!(diff.removed, vec![(BundleName::new("b"), hash("h2"))]);
        assert!(diff.changed.is_empty());
    }

    #[test]
    fn diff_carries_the_old_hash_for_changed_bundles() {
        let old = manifest(&[("a", "h1")]);
        let new = manifest(&[("a", "h2")]);

        let diff = Manifest::diff(&old, &new);
        assert!(diff.added.is_empty() && diff.removed.is_empty());
        assert_eq!(diff.changed, vec![(BundleName::new("a"), hash("h1"))]);
        assert_eq!(diff.purge_targets().count(), 1);
    }

    #[test]
    fn transitive_dependencies_walk_diamonds_once() {
        let mut m = manifest(&[("root", "h"), ("left", "h"), ("right", "h"), ("base", "h")]);
        m.set_dependencies("root", [BundleName::new("left"), BundleName::new("right")]);
        m.set_dependencies("left", [BundleName::new("base")]);
        m.set_dependencies("right", [BundleName::new("base")]);

        let deps = m.transitive_dependencies(&BundleName::new("root"));
        assert_eq!(deps.len(), 3);
        assert_eq!(
            deps.iter().filter(|d| d.as_str() == "base").count(),
            1,
            "diamond dependency must be visited once"
        );
    }

    #[test]
    fn manifest_payload_round_trips() {
        let mut m = manifest(&[("shared", "ha"), ("level1", "hb")]);
        m.set_dependencies("level1", [BundleName::new("shared")]);

        let parsed = Manifest::from_slice(&m.to_vec()).unwrap();
        assert_eq!(parsed, m);
        assert_eq!(
            parsed.direct_dependencies(&BundleName::new("level1")),
            &[BundleName::new("shared")]
        );
    }

    #[test]
    fn garbage_payload_is_a_manifest_error() {
        assert!(matches!(
            Manifest::from_slice(b"not json"),
            Err(Error::Manifest(_))
        ));
    }
}
