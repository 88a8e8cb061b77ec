//! Module and cluster wrappers
//!
//! A module groups clusters under one mount lifecycle. Each cluster wrapper
//! owns the [`Registry`] of its live supervisors.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::pipeline::Cluster;
use crate::registry::Registry;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Flags {
    pub mounted: bool,
    pub marked_for_deletion: bool,
}

#[derive(Debug, Default)]
pub(crate) struct FlagCell(RwLock<Flags>);

impl FlagCell {
    pub fn read(&self) -> RwLockReadGuard<'_, Flags> {
        self.0.read().unwrap_or_else(|p| p.into_inner())
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Flags> {
        self.0.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn get(&self) -> Flags {
        *self.read()
    }

    /// Returns whether the value changed
    pub fn set_mounted(&self, mounted: bool) -> bool {
        let mut flags = self.write();
        let changed = flags.mounted != mounted;
        flags.mounted = mounted;
        changed
    }
}

pub struct ClusterWrapper {
    identifier: String,
    cluster: Arc<dyn Cluster>,
    pub(crate) flags: FlagCell,
    registry: Registry,
}

impl std::fmt::Debug for ClusterWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterWrapper")
            .field("identifier", &self.identifier)
            .field("flags", &self.flags.get())
            .field("live", &self.registry.len())
            .finish()
    }
}

impl ClusterWrapper {
    pub fn new(identifier: impl Into<String>, cluster: Arc<dyn Cluster>) -> Self {
        Self {
            identifier: identifier.into(),
            cluster,
            flags: FlagCell::default(),
            registry: Registry::new(),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn cluster(&self) -> Arc<dyn Cluster> {
        Arc::clone(&self.cluster)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn is_mounted(&self) -> bool {
        self.flags.get().mounted
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.flags.get().marked_for_deletion
    }

    /// Suspend live stream runs, returning how many were suspended
    pub fn suspend_streams(&self) -> usize {
        let mut suspended = 0;
        for supervisor in self.registry.snapshot() {
            if supervisor.config().is_stream() {
                supervisor.suspend();
                suspended += 1;
            }
        }
        suspended
    }

    pub fn info(&self) -> ClusterInfo {
        let flags = self.flags.get();
        ClusterInfo {
            identifier: self.identifier.clone(),
            mounted: flags.mounted,
            marked_for_deletion: flags.marked_for_deletion,
            live_supervisors: self.registry.ids(),
        }
    }
}

#[derive(Debug)]
pub struct ModuleWrapper {
    identifier: String,
    pub(crate) flags: FlagCell,
    clusters: RwLock<BTreeMap<String, Arc<ClusterWrapper>>>,
}

impl ModuleWrapper {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            flags: FlagCell::default(),
            clusters: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn is_mounted(&self) -> bool {
        self.flags.get().mounted
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.flags.get().marked_for_deletion
    }

    pub fn cluster(&self, identifier: &str) -> Option<Arc<ClusterWrapper>> {
        self.read_clusters().get(identifier).cloned()
    }

    pub fn clusters(&self) -> Vec<Arc<ClusterWrapper>> {
        self.read_clusters().values().cloned().collect()
    }

    /// `false` if the identifier is taken
    pub(crate) fn insert(&self, wrapper: ClusterWrapper) -> bool {
        let mut clusters = self.write_clusters();
        if clusters.contains_key(wrapper.identifier()) {
            return false;
        }
        clusters.insert(wrapper.identifier().to_string(), Arc::new(wrapper));
        true
    }

    /// No cluster has a supervisor that has not reported completion
    pub fn is_idle(&self) -> bool {
        self.read_clusters().values().all(|c| c.registry().is_empty())
    }

    /// Remove the cluster if it is idle
    pub(crate) fn remove_if_idle(&self, identifier: &str) -> bool {
        let mut clusters = self.write_clusters();
        match clusters.get(identifier) {
            Some(c) if c.registry().is_empty() => {
                clusters.remove(identifier);
                true
            }
            _ => false,
        }
    }

    /// Drop marked clusters that have gone idle, returning their identifiers
    pub(crate) fn purge_marked(&self) -> Vec<String> {
        let mut clusters = self.write_clusters();
        let doomed: Vec<String> = clusters
            .values()
            .filter(|c| c.is_marked_for_deletion() && c.registry().is_empty())
            .map(|c| c.identifier().to_string())
            .collect();
        for id in &doomed {
            clusters.remove(id);
        }
        doomed
    }

    pub fn info(&self) -> ModuleInfo {
        let flags = self.flags.get();
        ModuleInfo {
            identifier: self.identifier.clone(),
            mounted: flags.mounted,
            marked_for_deletion: flags.marked_for_deletion,
            clusters: self.clusters().iter().map(|c| c.info()).collect(),
        }
    }

    fn read_clusters(&self) -> RwLockReadGuard<'_, BTreeMap<String, Arc<ClusterWrapper>>> {
        self.clusters.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_clusters(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Arc<ClusterWrapper>>> {
        self.clusters.write().unwrap_or_else(|p| p.into_inner())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub identifier: String,
    pub mounted: bool,
    pub marked_for_deletion: bool,
    pub live_supervisors: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub identifier: String,
    pub mounted: bool,
    pub marked_for_deletion: bool,
    pub clusters: Vec<ClusterInfo>,
}
