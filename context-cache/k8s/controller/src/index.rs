use crate::WorkQueue;
use ahash::AHashMap as HashMap;
use context_cache_k8s_api::{GlobalContextEntry, GlobalContextEntrySpec, ResourceExt};
use parking_lot::RwLock;
use std::{collections::hash_map::Entry, sync::Arc};

pub type SharedIndex = Arc<RwLock<Index>>;

/// Holds the latest spec of every `GlobalContextEntry` and queues names whose spec changed.
///
/// Updates that only touch an object's status or metadata are not queued, so status writes do
/// not cause entries to be rebuilt.
#[derive(Debug)]
pub struct Index {
    specs: HashMap<String, Arc<GlobalContextEntrySpec>>,
    queue: WorkQueue,
}

impl Index {
    pub fn shared(queue: WorkQueue) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            specs: HashMap::default(),
            queue,
        }))
    }

    pub fn get(&self, name: &str) -> Option<Arc<GlobalContextEntrySpec>> {
        self.specs.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

impl kubert::index::IndexClusterResource<GlobalContextEntry> for Index {
    fn apply(&mut self, resource: GlobalContextEntry) {
        let name = resource.name_unchecked();
        let spec = resource.spec;
        match self.specs.entry(name.clone()) {
            Entry::Occupied(mut entry) => {
                if **entry.get() == spec {
                    tracing::trace!(%name, "Spec unchanged");
                    return;
                }
                entry.insert(Arc::new(spec));
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(spec));
            }
        }
        tracing::debug!(%name, "Queueing updated entry");
        self.queue.add(name);
    }

    fn delete(&mut self, name: String) {
        if self.specs.remove(&name).is_some() {
            tracing::debug!(%name, "Queueing deleted entry");
            self.queue.add(name);
        }
    }

    // Resets apply each listed object and delete those that vanished, so unchanged objects are
    // not requeued.
}
