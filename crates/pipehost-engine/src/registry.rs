//! Live supervisors of one cluster

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::pipeline::{Supervisor, SupervisorStatus};

#[derive(Debug, Default)]
struct Inner {
    next: u32,
    live: HashMap<u32, Arc<Supervisor>>,
}

/// Id allocator and table of running supervisors
///
/// Ids count up from zero and wrap back to zero before reaching `u32::MAX`,
/// skipping any id still held by a live supervisor.
#[derive(Debug, Default)]
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn starting_at(next: u32) -> Self {
        Self {
            inner: RwLock::new(Inner {
                next,
                live: HashMap::new(),
            }),
        }
    }

    /// Assign an id to `supervisor` and make it live
    pub fn register(&self, supervisor: Arc<Supervisor>) -> u32 {
        let mut inner = self.write();
        Self::insert(&mut inner, supervisor)
    }

    /// Register only if nothing is live, otherwise return a live id
    pub fn register_exclusive(&self, supervisor: Arc<Supervisor>) -> Result<u32, u32> {
        let mut inner = self.write();
        if let Some(live) = inner.live.keys().min().copied() {
            return Err(live);
        }
        Ok(Self::insert(&mut inner, supervisor))
    }

    fn insert(inner: &mut Inner, supervisor: Arc<Supervisor>) -> u32 {
        let id = loop {
            let candidate = inner.next;
            inner.next = if candidate >= u32::MAX - 1 {
                0
            } else {
                candidate + 1
            };
            if !inner.live.contains_key(&candidate) {
                break candidate;
            }
        };

        supervisor.assign_id(id);
        inner.live.insert(id, supervisor);
        id
    }

    pub fn unregister(&self, id: u32) -> Option<Arc<Supervisor>> {
        self.write().live.remove(&id)
    }

    pub fn get(&self, id: u32) -> Option<Arc<Supervisor>> {
        self.read().live.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().live.is_empty()
    }

    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.read().live.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn snapshot(&self) -> Vec<Arc<Supervisor>> {
        self.read().live.values().cloned().collect()
    }

    /// Status of every live supervisor, ordered by id
    pub fn statuses(&self) -> Vec<SupervisorStatus> {
        let mut statuses: Vec<SupervisorStatus> =
            self.snapshot().iter().map(|s| s.status()).collect();
        statuses.sort_by_key(|s| s.id);
        statuses
    }

    /// Suspend every live supervisor, returning how many were live
    pub fn suspend_all(&self) -> usize {
        let live = self.snapshot();
        for supervisor in &live {
            supervisor.suspend();
        }
        live.len()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|p| p.into_inner())
    }
}
