use super::*;
use crate::metrics::Outcome;
use ahash::AHashMap as HashMap;
use context_cache_core::{
    Entry, Error, JmesPath, Notify, Projections, Reason, Snapshot, Store, Value, RAW,
};
use context_cache_k8s_api::{
    ExternalApiCall, GlobalContextEntry, GlobalContextEntrySpec, GlobalContextEntryStatus,
    KubernetesResource, Projection,
};
use kubert::index::IndexClusterResource;
use parking_lot::Mutex;
use serde_json::json;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{task::JoinHandle, time};
use tokio_util::sync::CancellationToken;

struct FakeEntry {
    snapshot: Snapshot,
    stops: AtomicUsize,
}

#[async_trait::async_trait]
impl Entry for FakeEntry {
    fn get(&self, projection: &str) -> Result<Arc<Value>, Error> {
        self.snapshot.get(projection)
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

impl FakeEntry {
    fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Default)]
struct Builder(Arc<BuilderState>);

#[derive(Default)]
struct BuilderState {
    built: Mutex<Vec<(String, Arc<FakeEntry>)>>,
    attempts: Mutex<HashMap<String, usize>>,
    failures: Mutex<HashMap<String, usize>>,
    notes: Mutex<Vec<(String, Reason)>>,
    deletes: Mutex<Vec<String>>,
}

struct Recorder {
    name: String,
    state: Arc<BuilderState>,
}

impl Notify for Recorder {
    fn refreshed(&self) {}

    fn failed(&self, reason: Reason, _: &Error) {
        self.state.notes.lock().push((self.name.clone(), reason));
    }

    fn deleted(&self) {
        self.state.deletes.lock().push(self.name.clone());
    }
}

#[async_trait::async_trait]
impl BuildEntry for Builder {
    fn notify(&self, name: &str, _: Option<Source<'_>>) -> Arc<dyn Notify> {
        Arc::new(Recorder {
            name: name.to_string(),
            state: self.0.clone(),
        })
    }

    async fn build(
        &self,
        name: &str,
        source: Source<'_>,
        projections: Projections,
        _: Arc<dyn Notify>,
        _: CancellationToken,
    ) -> anyhow::Result<Arc<dyn Entry>> {
        *self.0.attempts.lock().entry(name.to_string()).or_default() += 1;
        if let Some(remaining) = self.0.failures.lock().get_mut(name) {
            if *remaining > 0 {
                *remaining -= 1;
                anyhow::bail!("discovery failed");
            }
        }

        let raw = match source {
            Source::Resource(resource) => json!({ "resource": resource.to_string() }),
            Source::ApiCall(call) => json!({ "url": call.url_path }),
        };
        let entry = Arc::new(FakeEntry {
            snapshot: projections.compute(raw)?,
            stops: AtomicUsize::new(0),
        });
        self.0
            .built
            .lock()
            .push((name.to_string(), entry.clone()));
        Ok(entry)
    }
}

impl Builder {
    fn fail(&self, name: &str, times: usize) {
        self.0.failures.lock().insert(name.to_string(), times);
    }

    fn built(&self, name: &str) -> Vec<Arc<FakeEntry>> {
        self.0
            .built
            .lock()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, e)| e.clone())
            .collect()
    }

    fn attempts(&self, name: &str) -> usize {
        self.0.attempts.lock().get(name).copied().unwrap_or_default()
    }

    fn notes(&self) -> Vec<(String, Reason)> {
        self.0.notes.lock().clone()
    }

    fn deletes(&self) -> Vec<String> {
        self.0.deletes.lock().clone()
    }
}

struct Harness {
    index: SharedIndex,
    store: Store,
    builder: Builder,
    metrics: ControllerMetrics,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

fn start(max_retries: u32) -> Harness {
    let queue = WorkQueue::new();
    let index = Index::shared(queue.clone());
    let store = Store::new();
    let builder = Builder::default();
    let metrics = ControllerMetrics::default();
    let controller = Controller::new(
        index.clone(),
        queue,
        store.clone(),
        builder.clone(),
        Arc::new(JmesPath::new()),
        max_retries,
        metrics.clone(),
    );
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(controller.run(2, shutdown.clone()));
    Harness {
        index,
        store,
        builder,
        metrics,
        shutdown,
        task,
    }
}

fn api_call(name: &str, url_path: &str) -> GlobalContextEntry {
    GlobalContextEntry::new(
        name,
        GlobalContextEntrySpec {
            kubernetes_resource: None,
            api_call: Some(ExternalApiCall {
                url_path: Some(url_path.to_string()),
                ..Default::default()
            }),
            projections: vec![Projection {
                name: "path".to_string(),
                jmes_path: "url".to_string(),
            }],
        },
    )
}

async fn eventually(mut check: impl FnMut() -> bool) {
    time::timeout(Duration::from_secs(5), async {
        while !check() {
            time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition must hold eventually");
}

fn value(store: &Store, name: &str, projection: &str) -> Option<Value> {
    let entry = store.get(name)?;
    entry.get(projection).ok().map(|v| (*v).clone())
}

#[tokio::test(flavor = "multi_thread")]
async fn installs_entries() {
    let h = start(10);
    h.index.write().apply(api_call("a", "/api"));

    eventually(|| h.store.get("a").is_some()).await;
    assert_eq!(value(&h.store, "a", "path"), Some(json!("/api")));
    assert_eq!(value(&h.store, "a", RAW), Some(json!({ "url": "/api" })));
    assert_eq!(h.metrics.count(Outcome::Installed), 1);

    h.index.write().apply(GlobalContextEntry::new(
        "cms",
        GlobalContextEntrySpec {
            kubernetes_resource: Some(KubernetesResource {
                group: String::new(),
                version: "v1".to_string(),
                resource: "configmaps".to_string(),
                namespace: None,
            }),
            api_call: None,
            projections: vec![],
        },
    ));
    eventually(|| h.store.get("cms").is_some()).await;
    assert_eq!(
        value(&h.store, "cms", RAW),
        Some(json!({ "resource": "v1/configmaps" }))
    );
    assert_eq!(h.store.names(), vec!["a", "cms"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn ignores_status_changes() {
    let h = start(10);
    h.index.write().apply(api_call("a", "/api"));
    eventually(|| h.store.get("a").is_some()).await;

    let mut updated = api_call("a", "/api");
    updated.status = Some(GlobalContextEntryStatus::default());
    h.index.write().apply(updated);
    time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.builder.attempts("a"), 1);
    assert_eq!(h.builder.built("a")[0].stops(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn replaces_entries_on_spec_change() {
    let h = start(10);
    h.index.write().apply(api_call("a", "/api"));
    eventually(|| h.store.get("a").is_some()).await;

    h.index.write().apply(api_call("a", "/apis"));
    eventually(|| value(&h.store, "a", "path") == Some(json!("/apis"))).await;

    let built = h.builder.built("a");
    assert_eq!(built.len(), 2);
    assert_eq!(built[0].stops(), 1, "replaced entry must be stopped");
    assert_eq!(built[1].stops(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn deletes_entries() {
    let h = start(10);
    h.index.write().apply(api_call("a", "/api"));
    eventually(|| h.store.get("a").is_some()).await;

    h.index.write().delete("a".to_string());
    eventually(|| !h.builder.deletes().is_empty()).await;

    assert!(h.store.get("a").is_none());
    assert_eq!(h.builder.deletes(), vec!["a"]);
    assert_eq!(h.builder.built("a")[0].stops(), 1);
    assert_eq!(h.metrics.count(Outcome::Deleted), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_specs_install_invalid_entries() {
    let h = start(10);
    h.index.write().apply(GlobalContextEntry::new(
        "a",
        GlobalContextEntrySpec {
            kubernetes_resource: None,
            api_call: None,
            projections: vec![],
        },
    ));
    eventually(|| h.store.get("a").is_some()).await;

    let error = h.store.get("a").unwrap().get(RAW).expect_err("entry is invalid");
    assert!(matches!(error, Error::Invalid(_)), "{error}");
    assert_eq!(h.builder.attempts("a"), 0);
    assert_eq!(h.builder.notes(), vec![("a".to_string(), Reason::BuildFailed)]);
    assert_eq!(h.metrics.count(Outcome::Invalid), 1);

    // Fixing the spec replaces the invalid entry.
    h.index.write().apply(api_call("a", "/api"));
    eventually(|| value(&h.store, "a", "path").is_some()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn retries_failed_builds() {
    let h = start(10);
    h.builder.fail("a", 2);
    h.index.write().apply(api_call("a", "/api"));

    eventually(|| h.store.get("a").is_some()).await;
    assert_eq!(h.builder.attempts("a"), 3);
    assert_eq!(h.metrics.count(Outcome::Requeued), 2);
    assert!(h.builder.notes().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn drops_entries_after_max_retries() {
    let h = start(2);
    h.builder.fail("a", usize::MAX);
    h.index.write().apply(api_call("a", "/api"));

    eventually(|| h.metrics.count(Outcome::Dropped) == 1).await;
    assert_eq!(h.builder.attempts("a"), 3);
    assert!(h.store.get("a").is_none());
    assert_eq!(h.builder.notes(), vec![("a".to_string(), Reason::BuildFailed)]);

    // The worker pool keeps serving other entries.
    h.index.write().apply(api_call("b", "/api"));
    eventually(|| h.store.get("b").is_some()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_stops_entries() {
    let h = start(10);
    let expected = maplit::btreeset! {"a".to_string(), "b".to_string()};
    for name in &expected {
        h.index.write().apply(api_call(name, "/api"));
    }
    eventually(|| h.store.len() == expected.len()).await;

    h.shutdown.cancel();
    time::timeout(Duration::from_secs(5), h.task)
        .await
        .expect("controller must stop")
        .expect("controller must not panic");

    assert!(h.store.is_empty());
    for name in &expected {
        assert_eq!(h.builder.built(name)[0].stops(), 1);
    }
}
