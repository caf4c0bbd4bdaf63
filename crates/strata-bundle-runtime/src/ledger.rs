use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

use tracing::debug;

use crate::{Bundle, BundleName, Error, Manifest, OperationId};

/// An identifier holding a bundle loaded: either another bundle that depends
/// on it, or an in-flight asset operation reading from it.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Requester {
    Bundle(BundleName),
    Operation(OperationId),
}

impl fmt::Display for Requester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bundle(name) => write!(f, "bundle:{name}"),
            Self::Operation(id) => write!(f, "op:{id}"),
        }
    }
}

/// The terminal outcome of a bundle fetch, kept per name.
///
/// Failed fetches keep a slot too: dependents must observe the failure
/// instead of waiting forever for a bundle that will never arrive.
#[derive(Clone, Debug)]
pub enum BundleSlot {
    Ready(Arc<Bundle>),
    Failed(Error),
}

/// Decides bundle lifetime purely from reference counts plus the
/// always-resident override policy.
///
/// Unload-eligible bundles are never released synchronously; they accumulate
/// in an unloadable set that the facade drains once per tick, after the
/// tick's dependency bookkeeping is final. A bundle that is re-required in
/// the same tick therefore never bounces through an unload.
pub(crate) struct DependencyLedger {
    loaded: HashMap<BundleName, BundleSlot>,
    depended: HashMap<BundleName, HashSet<Requester>>,
    /// Bundles that became unload-eligible during the current tick; promoted
    /// to `ripe` at the end of it, so a release and its unload are never on
    /// the same tick.
    unloadable: HashSet<BundleName>,
    /// Bundles eligible since a previous tick; the next drain releases them.
    ripe: HashSet<BundleName>,
    resident_prefixes: Vec<String>,
}

impl DependencyLedger {
    pub fn new(resident_prefixes: Vec<String>) -> Self {
        Self {
            loaded: HashMap::new(),
            depended: HashMap::new(),
            unloadable: HashSet::new(),
            ripe: HashSet::new(),
            resident_prefixes,
        }
    }

    /// Register the outcome of a finished bundle fetch.
    pub fn install(&mut self, name: &BundleName, bundle: Arc<Bundle>) {
        self.loaded.insert(name.clone(), BundleSlot::Ready(bundle));
    }

    pub fn install_failed(&mut self, name: &BundleName, error: Error) {
        self.loaded.insert(name.clone(), BundleSlot::Failed(error));
    }

    /// The live content handle for `name`, when its fetch succeeded.
    pub fn bundle(&self, name: &BundleName) -> Option<Arc<Bundle>> {
        match self.loaded.get(name) {
            Some(BundleSlot::Ready(bundle)) => Some(Arc::clone(bundle)),
            _ => None,
        }
    }

    pub fn failure(&self, name: &BundleName) -> Option<Error> {
        match self.loaded.get(name) {
            Some(BundleSlot::Failed(error)) => Some(error.clone()),
            _ => None,
        }
    }

    pub fn is_ready(&self, name: &BundleName) -> bool {
        matches!(self.loaded.get(name), Some(BundleSlot::Ready(_)))
    }

    /// Record that `requester` needs `name` loaded.
    ///
    /// A `None` requester is the provisional seed a completed bundle fetch
    /// places on itself: it asserts nothing and simply re-evaluates unload
    /// eligibility, so a bundle nobody registered against becomes unloadable.
    pub fn add_dependency(&mut self, name: &BundleName, requester: Option<Requester>) {
        if !self.depended.contains_key(name) {
            match requester {
                None => {
                    self.update_eligibility(name);
                    return;
                }
                Some(requester) => {
                    self.depended
                        .insert(name.clone(), HashSet::from([requester]));
                }
            }
        } else if let Some(requester) = requester {
            self.depended.get_mut(name).unwrap().insert(requester);
        }
        self.update_eligibility(name);
    }

    /// Record that `requester` no longer needs `name` loaded.
    pub fn remove_dependency(&mut self, name: &BundleName, requester: &Requester) {
        if let Some(set) = self.depended.get_mut(name) {
            set.remove(requester);
        }
        self.update_eligibility(name);
    }

    fn update_eligibility(&mut self, name: &BundleName) {
        let has_dependents = self.depended.get(name).is_some_and(|set| !set.is_empty());

        if has_dependents || self.is_resident(name) {
            self.unloadable.remove(name);
            self.ripe.remove(name);
        } else {
            self.unloadable.insert(name.clone());
            self.depended.remove(name);
        }
    }

    fn is_resident(&self, name: &BundleName) -> bool {
        self.resident_prefixes
            .iter()
            .any(|prefix| name.as_str().starts_with(prefix.as_str()))
    }

    pub fn dependents(&self, name: &BundleName) -> Option<&HashSet<Requester>> {
        self.depended.get(name)
    }

    #[cfg(test)]
    pub fn is_unloadable(&self, name: &BundleName) -> bool {
        self.unloadable.contains(name) || self.ripe.contains(name)
    }

    /// Release every bundle that has been unload-eligible since before this
    /// tick: drop its dependent tracking, propagate the release to its
    /// transitive dependencies, and drop the content handle. Returns the
    /// names that were drained.
    ///
    /// Bundles that became eligible during the current tick are only
    /// promoted here; they are released by the next drain at the earliest,
    /// so a bundle that is immediately re-required never bounces through an
    /// unload.
    pub fn drain_unloadable(&mut self, manifest: Option<&Manifest>) -> Vec<BundleName> {
        let drained: Vec<BundleName> = self.ripe.drain().collect();

        for name in &drained {
            self.depended.remove(name);
            if self.loaded.remove(name).is_some() {
                debug!("bundle `{name}` has been unloaded");
            }
            if let Some(manifest) = manifest {
                for dep in manifest.transitive_dependencies(name) {
                    self.remove_dependency(&dep, &Requester::Bundle(name.clone()));
                }
            }
        }

        self.ripe = std::mem::take(&mut self.unloadable);
        drained
    }

    /// Forget a failed fetch outcome so the bundle can be requested again.
    /// Dependent tracking is left untouched.
    pub fn clear_failure(&mut self, name: &BundleName) {
        if matches!(self.loaded.get(name), Some(BundleSlot::Failed(_))) {
            self.loaded.remove(name);
        }
    }

    /// Release one bundle immediately, without touching its dependencies.
    pub fn unload_one(&mut self, name: &BundleName) {
        self.depended.remove(name);
        self.unloadable.remove(name);
        self.ripe.remove(name);
        if self.loaded.remove(name).is_some() {
            debug!("bundle `{name}` has been unloaded");
        }
    }

    /// Release everything.
    pub fn unload_all(&mut self) {
        self.loaded.clear();
        self.depended.clear();
        self.unloadable.clear();
        self.ripe.clear();
    }
}
