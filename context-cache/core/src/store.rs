use crate::Entry;
use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// Maps entry names to live entries.
///
/// Writes are serialized so that an entry being replaced or removed is always stopped before
/// its slot changes; at most one entry is live for a given name. Reads only contend with the
/// brief swap of a map slot and never wait for an entry to stop.
#[derive(Clone, Default)]
pub struct Store(Arc<Inner>);

#[derive(Default)]
struct Inner {
    entries: RwLock<HashMap<String, Arc<dyn Entry>>>,
    writer: tokio::sync::Mutex<()>,
}

// === impl Store ===

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `entry` under `name`, stopping the entry it replaces.
    pub async fn set(&self, name: impl Into<String>, entry: Arc<dyn Entry>) {
        let name = name.into();
        let _writer = self.0.writer.lock().await;

        let prior = self.0.entries.read().get(&name).cloned();
        if let Some(prior) = prior {
            tracing::debug!(%name, "Stopping replaced entry");
            prior.stop().await;
        }

        self.0.entries.write().insert(name, entry);
    }

    /// Stops and removes the entry named `name`. Returns false if there was none.
    pub async fn delete(&self, name: &str) -> bool {
        let _writer = self.0.writer.lock().await;

        let Some(prior) = self.0.entries.read().get(name).cloned() else {
            return false;
        };
        tracing::debug!(%name, "Stopping deleted entry");
        prior.stop().await;

        self.0.entries.write().remove(name);
        true
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Entry>> {
        self.0.entries.read().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.0.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn names(&self) -> Vec<String> {
        let mut names = self.0.entries.read().keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    /// Stops and removes every entry.
    pub async fn clear(&self) {
        let _writer = self.0.writer.lock().await;

        let entries = self.0.entries.read().values().cloned().collect::<Vec<_>>();
        for entry in entries {
            entry.stop().await;
        }
        self.0.entries.write().clear();
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("entries", &self.names())
            .finish()
    }
}
