//! Global context entries that mirror Kubernetes resources.
//!
//! A [`ResourceEntry`] watches every object of one resource type and serves the objects, sorted
//! by namespace and name, as a JSON array. Projections are recomputed after each batch of watch
//! events so that they never lag the raw list.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::{anyhow, Context};
use context_cache_core::{
    Entry, Error, InvalidEntry, Notify, Projections, Reason, Snapshot, Task, Value,
};
use context_cache_k8s_api::{Api, ApiResource, Client, DynamicObject, KubernetesResource};
use futures::prelude::*;
use kube::{
    core::GroupVersion,
    discovery::{self, Scope},
    runtime::{
        reflector::store::{Store, Writer},
        watcher, WatchStreamExt,
    },
};
use parking_lot::RwLock;
use std::{sync::Arc, time::Duration};
use tokio::{sync::oneshot, time};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;


/// Mirrors all objects of one resource type.
pub struct ResourceEntry {
    resource: ApiResource,
    state: Arc<RwLock<Snapshot>>,
    task: Task,
}

/// Applies watch events to the mirror and publishes snapshots.
struct Mirror {
    writer: Writer<DynamicObject>,
    reader: Store<DynamicObject>,
    projections: Projections,
    notify: Arc<dyn Notify>,
    state: Arc<RwLock<Snapshot>>,
    listed: bool,
    synced: Option<oneshot::Sender<()>>,
}

pub type WatchEvent = Result<watcher::Event<DynamicObject>, watcher::Error>;

/// Resolves a resource declaration to its API resource and whether it is namespaced.
pub async fn discover(
    client: &Client,
    resource: &KubernetesResource,
) -> anyhow::Result<(ApiResource, bool)> {
    let gv = GroupVersion::gv(&resource.group, &resource.version);
    let group = discovery::pinned_group(client, &gv)
        .await
        .with_context(|| format!("failed to discover {}", gv.api_version()))?;
    group
        .versioned_resources(&resource.version)
        .into_iter()
        .find(|(ar, _)| ar.plural == resource.resource)
        .map(|(ar, caps)| (ar, matches!(caps.scope, Scope::Namespaced)))
        .ok_or_else(|| anyhow!("resource {resource} not found"))
}

// === impl ResourceEntry ===

impl ResourceEntry {
    /// Discovers and starts mirroring `resource`.
    ///
    /// Discovery errors are returned so that the caller may retry. A mirror that fails to sync
    /// produces an [`InvalidEntry`] serving the sync error.
    pub async fn watch(
        client: Client,
        resource: &KubernetesResource,
        projections: Projections,
        notify: Arc<dyn Notify>,
        sync_timeout: Duration,
        cancel: CancellationToken,
    ) -> anyhow::Result<Arc<dyn Entry>> {
        let (ar, namespaced) = discover(&client, resource).await?;
        let api = match resource.namespace.as_deref() {
            Some(ns) if namespaced && !ns.is_empty() => {
                Api::<DynamicObject>::namespaced_with(client, ns, &ar)
            }
            _ => Api::<DynamicObject>::all_with(client, &ar),
        };
        let events = watcher::watcher(api, watcher::Config::default()).default_backoff();

        match Self::spawn(events, ar, projections, notify, sync_timeout, cancel).await {
            Ok(entry) => Ok(Arc::new(entry)),
            Err(error) => Ok(InvalidEntry::shared(error)),
        }
    }

    /// Starts mirroring the objects described by `events` and waits for the initial list to be
    /// applied.
    ///
    /// The wait ends with an error after `sync_timeout` or when `cancel` fires. In that case the
    /// background task is stopped and the error is reported to `notify`.
    pub async fn spawn<S>(
        events: S,
        resource: ApiResource,
        projections: Projections,
        notify: Arc<dyn Notify>,
        sync_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Self, Error>
    where
        S: Stream<Item = WatchEvent> + Send + 'static,
    {
        let state = Arc::new(RwLock::new(Snapshot::default()));
        let (synced_tx, synced_rx) = oneshot::channel();
        let writer = Writer::new(resource.clone());
        let mirror = Mirror {
            reader: writer.as_reader(),
            writer,
            projections,
            notify: notify.clone(),
            state: state.clone(),
            listed: false,
            synced: Some(synced_tx),
        };
        let task = Task::spawn(
            cancel.clone(),
            mirror.run(events, cancel.clone()).in_current_span(),
        );
        let entry = Self {
            resource,
            state,
            task,
        };

        let synced = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(anyhow!("cancelled while waiting for the initial sync")),
            res = synced_rx => res.map_err(|_| anyhow!("watch ended before the initial sync")),
            () = time::sleep(sync_timeout) => {
                Err(anyhow!("timed out after {sync_timeout:?} waiting for the initial sync"))
            }
        };
        match synced {
            Ok(()) => {
                tracing::info!(resource = %entry.resource.plural, "Synced");
                notify.refreshed();
                Ok(entry)
            }
            Err(error) => {
                entry.stop().await;
                let error = Error::sync(error);
                tracing::warn!(resource = %entry.resource.plural, %error, "Failed to sync");
                notify.failed(Reason::SyncFailed, &error);
                Err(error)
            }
        }
    }
}

#[async_trait::async_trait]
impl Entry for ResourceEntry {
    fn get(&self, projection: &str) -> Result<Arc<Value>, Error> {
        self.state.read().get(projection)
    }

    async fn stop(&self) {
        self.task.stop().await;
    }
}

impl std::fmt::Debug for ResourceEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceEntry")
            .field("resource", &self.resource.plural)
            .field("stopped", &self.task.is_cancelled())
            .finish()
    }
}

// === impl Mirror ===

impl Mirror {
    async fn run<S>(mut self, events: S, cancel: CancellationToken)
    where
        S: Stream<Item = WatchEvent> + Send,
    {
        tokio::pin!(events);
        loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                event = events.next() => match event {
                    Some(event) => event,
                    None => {
                        tracing::debug!("Watch ended");
                        break;
                    }
                },
            };

            // Apply every event that is already available before publishing, so that a burst
            // of changes is projected once.
            let mut changed = self.apply(event);
            while let Some(Some(event)) = events.next().now_or_never() {
                changed |= self.apply(event);
            }
            if changed {
                self.publish();
            }
        }
        tracing::debug!("Stopped");
    }

    fn apply(&mut self, event: WatchEvent) -> bool {
        match event {
            Ok(event) => {
                self.writer.apply_watcher_event(&event);
                match event {
                    watcher::Event::InitDone => {
                        self.listed = true;
                        true
                    }
                    watcher::Event::Init | watcher::Event::InitApply(_) => false,
                    watcher::Event::Apply(_) | watcher::Event::Delete(_) => self.listed,
                }
            }
            Err(error) => {
                tracing::warn!(%error, "Watch failed");
                self.notify.failed(Reason::WatchFailed, &Error::sync(error));
                false
            }
        }
    }

    fn publish(&mut self) {
        let mut objects = self.reader.state();
        objects.sort_by(|a, b| {
            let a = (a.metadata.namespace.as_deref(), a.metadata.name.as_deref());
            let b = (b.metadata.namespace.as_deref(), b.metadata.name.as_deref());
            a.cmp(&b)
        });
        let raw = match objects
            .iter()
            .map(|obj| serde_json::to_value(&**obj))
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(raw) => Value::Array(raw),
            Err(error) => {
                tracing::warn!(%error, "Failed to encode objects");
                return;
            }
        };

        let (snapshot, errors) = {
            let previous = self.state.read();
            self.projections.recompute(raw, Some(&*previous))
        };
        *self.state.write() = snapshot;
        tracing::trace!(objects = objects.len(), "Published");

        for error in errors {
            tracing::warn!(%error, "Projection failed");
            self.notify.failed(Reason::ProjectionFailed, &error);
        }

        if let Some(synced) = self.synced.take() {
            let _ = synced.send(());
        }
    }
}
