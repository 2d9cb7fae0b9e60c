//! Live instance cache.
//!
//! # Responsibility
//! - Track every live `Resource` per concrete class without owning it.
//! - Hand out the live instances of a class family for bulk revert.
//!
//! # Invariants
//! - Entries are `Weak`; dropping the last `Arc<Resource>` is enough to
//!   forget an instance, and losing an entry never loses data.
//! - At most one live instance per resource id is registered.
//! - Locks nest only in the order `classes`, `sets`, then one set's members.
//!   Set locks are never held while instances are reverted.
//! - Dead entries are dropped when looked up and swept every
//!   `PRUNE_INTERVAL` registrations.

use crate::model::ids::{ClassId, ResourceId};
use crate::model::resource::Resource;
use crate::model::schema::ResourceClass;
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Registrations between automatic sweeps of dead entries.
pub const PRUNE_INTERVAL: usize = 256;

/// Weak members of one class.
#[derive(Debug, Default)]
pub struct InstanceSet {
    members: Mutex<HashMap<ResourceId, Weak<Resource>>>,
}

impl InstanceSet {
    /// Upgrades live members. Dead ones stay until the cache sweeps them.
    pub fn live(&self) -> Vec<Arc<Resource>> {
        self.members.lock().values().filter_map(Weak::upgrade).collect()
    }

    fn get(&self, id: ResourceId) -> Option<Arc<Resource>> {
        self.members.lock().get(&id).and_then(Weak::upgrade)
    }

    fn insert(&self, resource: &Arc<Resource>) {
        self.members
            .lock()
            .insert(resource.id(), Arc::downgrade(resource));
    }

    fn remove(&self, id: ResourceId) -> bool {
        self.members.lock().remove(&id).is_some()
    }

    /// Removes dead members and returns their ids.
    fn prune(&self) -> Vec<ResourceId> {
        let mut members = self.members.lock();
        let mut dead = Vec::new();
        members.retain(|id, weak| {
            let alive = weak.strong_count() > 0;
            if !alive {
                dead.push(*id);
            }
            alive
        });
        dead
    }

    fn counts(&self) -> (usize, usize) {
        let members = self.members.lock();
        let live = members.values().filter(|weak| weak.strong_count() > 0).count();
        (live, members.len() - live)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub classes: usize,
    pub live: usize,
    pub dead: usize,
}

#[derive(Debug, Default)]
pub struct InstanceCache {
    sets: Mutex<HashMap<ClassId, Arc<InstanceSet>>>,
    /// Resource id to its concrete class, for id lookups.
    classes: Mutex<HashMap<ResourceId, ClassId>>,
    since_prune: AtomicUsize,
}

impl InstanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, class: ClassId) -> Option<Arc<InstanceSet>> {
        self.sets.lock().get(&class).cloned()
    }

    /// Registers `resource`, or returns the instance already live for its id.
    ///
    /// The lookup and the insert happen under one `classes` lock, so racing
    /// loads of the same id all end up sharing the first registered instance.
    pub fn register(&self, resource: Arc<Resource>) -> Arc<Resource> {
        let id = resource.id();
        let class = resource.class().id;
        let mut classes = self.classes.lock();
        if let Some(existing) = self.lookup(&mut classes, id) {
            return existing;
        }
        let set = self.sets.lock().entry(class).or_default().clone();
        set.insert(&resource);
        classes.insert(id, class);

        if self.since_prune.fetch_add(1, Ordering::Relaxed) + 1 >= PRUNE_INTERVAL {
            self.since_prune.store(0, Ordering::Relaxed);
            self.prune_locked(&mut classes);
        }
        resource
    }

    pub fn find(&self, id: ResourceId) -> Option<Arc<Resource>> {
        let mut classes = self.classes.lock();
        self.lookup(&mut classes, id)
    }

    /// Upgrades the entry for `id`, dropping it when the instance is gone.
    fn lookup(
        &self,
        classes: &mut HashMap<ResourceId, ClassId>,
        id: ResourceId,
    ) -> Option<Arc<Resource>> {
        let class = classes.get(&id).copied()?;
        let set = self.set(class);
        let found = set.as_ref().and_then(|set| set.get(id));
        if found.is_none() {
            classes.remove(&id);
            if let Some(set) = set {
                set.remove(id);
            }
        }
        found
    }

    pub fn remove(&self, id: ResourceId) -> bool {
        let Some(class) = self.classes.lock().remove(&id) else {
            return false;
        };
        self.set(class).is_some_and(|set| set.remove(id))
    }

    /// Live instances of `class` and its descendants.
    pub fn live_instances(&self, class: &ResourceClass) -> Vec<Arc<Resource>> {
        let sets: Vec<Arc<InstanceSet>> = {
            let sets = self.sets.lock();
            class
                .family_ids()
                .iter()
                .filter_map(|id| sets.get(id).cloned())
                .collect()
        };
        sets.iter().flat_map(|set| set.live()).collect()
    }

    /// Drops dead entries. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut classes = self.classes.lock();
        self.prune_locked(&mut classes)
    }

    fn prune_locked(&self, classes: &mut HashMap<ResourceId, ClassId>) -> usize {
        let sets: Vec<Arc<InstanceSet>> = self.sets.lock().values().cloned().collect();
        let dead: Vec<ResourceId> = sets.iter().flat_map(|set| set.prune()).collect();
        for id in &dead {
            classes.remove(id);
        }
        debug!("event=cache_prune module=repo status=ok removed={}", dead.len());
        dead.len()
    }

    /// Number of ids with a class entry, live or not yet swept.
    pub fn tracked(&self) -> usize {
        self.classes.lock().len()
    }

    pub fn stats(&self) -> CacheStats {
        let sets: Vec<Arc<InstanceSet>> = self.sets.lock().values().cloned().collect();
        let mut stats = CacheStats {
            classes: sets.len(),
            ..CacheStats::default()
        };
        for set in sets {
            let (live, dead) = set.counts();
            stats.live += live;
            stats.dead += dead;
        }
        stats
    }
}
