//! Priority ordered service collections.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use tracing::{debug, warn};

use crate::pipeline::{Service, Stage};

/// Identifies a registered service, used to remove it or change its priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceId(u64);

/// A registered service together with its ordering key.
#[derive(Clone)]
pub struct ServiceEntry {
    id: ServiceId,
    priority: i32,
    seq: u64,
    service: Arc<dyn Service>,
}

impl ServiceEntry {
    pub fn id(&self) -> ServiceId {
        self.id
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn service(&self) -> &Arc<dyn Service> {
        &self.service
    }
}

impl fmt::Debug for ServiceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceEntry")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("service", &self.service.name())
            .finish()
    }
}

/// The services of one stage, sorted by priority and stable by registration order.
///
/// Readers take a [`snapshot`](ServiceGroup::snapshot) and iterate it without locking. Every
/// mutation publishes a new sorted list, so a concurrent change never disturbs an iteration
/// that is already running.
pub struct ServiceGroup {
    stage: Stage,
    entries: ArcSwap<Vec<ServiceEntry>>,
}

/// Ids double as registration order, they are unique across all groups.
static NEXT_ID: AtomicU64 = AtomicU64::new(0);

impl ServiceGroup {
    pub fn new(stage: Stage) -> Self {
        Self { stage, entries: ArcSwap::from_pointee(Vec::new()) }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Registers a service, returning `None` when it belongs to another stage.
    pub fn add(&self, service: Arc<dyn Service>) -> Option<ServiceId> {
        if service.stage() != self.stage {
            warn!(service = service.name(), stage = %self.stage, "service registered for a different stage");
            return None;
        }
        Some(self.insert(service))
    }

    fn insert(&self, service: Arc<dyn Service>) -> ServiceId {
        let seq = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let entry = ServiceEntry { id: ServiceId(seq), priority: service.priority(), seq, service };
        debug!(service = entry.service.name(), stage = %self.stage, priority = entry.priority, "register service");

        self.entries.rcu(|entries| {
            let mut entries = Vec::clone(entries);
            entries.push(entry.clone());
            sort(&mut entries);
            entries
        });
        entry.id
    }

    /// Removes a service, returning whether it was registered.
    pub fn remove(&self, id: ServiceId) -> bool {
        let previous = self.entries.rcu(|entries| entries.iter().filter(|entry| entry.id != id).cloned().collect::<Vec<_>>());
        previous.iter().any(|entry| entry.id == id)
    }

    /// Changes the priority of a service and restores the ordering.
    pub fn update_priority(&self, id: ServiceId, priority: i32) -> bool {
        let previous = self.entries.rcu(|entries| {
            let mut entries = Vec::clone(entries);
            if let Some(entry) = entries.iter_mut().find(|entry| entry.id == id) {
                entry.priority = priority;
            }
            sort(&mut entries);
            entries
        });
        previous.iter().any(|entry| entry.id == id)
    }

    /// A stable copy of the current services in execution order.
    pub fn snapshot(&self) -> Arc<Vec<ServiceEntry>> {
        self.entries.load_full()
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }
}

fn sort(entries: &mut [ServiceEntry]) {
    entries.sort_by_key(|entry| (entry.priority, entry.seq));
}

impl fmt::Debug for ServiceGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceGroup").field("stage", &self.stage).field("entries", &self.entries.load()).finish()
    }
}

/// One [`ServiceGroup`] per stage.
#[derive(Debug)]
pub struct Services {
    groups: [ServiceGroup; 7],
}

impl Default for Services {
    fn default() -> Self {
        Self::new()
    }
}

impl Services {
    pub fn new() -> Self {
        Self { groups: Stage::ALL.map(ServiceGroup::new) }
    }

    /// Registers a service in the group of its stage.
    pub fn add<S: Service + 'static>(&self, service: S) -> ServiceId {
        self.add_shared(Arc::new(service))
    }

    pub fn add_shared(&self, service: Arc<dyn Service>) -> ServiceId {
        self.group(service.stage()).insert(service)
    }

    pub fn remove(&self, id: ServiceId) -> bool {
        self.groups.iter().any(|group| group.remove(id))
    }

    pub fn update_priority(&self, id: ServiceId, priority: i32) -> bool {
        self.groups.iter().any(|group| group.update_priority(id, priority))
    }

    pub fn group(&self, stage: Stage) -> &ServiceGroup {
        &self.groups[stage.index()]
    }
}
