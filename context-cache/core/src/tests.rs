use super::*;
use maplit::btreemap;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::time;

/// An entry that serves fixed data and tracks how many instances are running.
struct TestEntry {
    data: Arc<Value>,
    running: Arc<AtomicUsize>,
    stops: AtomicUsize,
}

impl TestEntry {
    fn new(data: Value, running: &Arc<AtomicUsize>) -> Arc<Self> {
        running.fetch_add(1, Ordering::SeqCst);
        Arc::new(Self {
            data: Arc::new(data),
            running: running.clone(),
            stops: AtomicUsize::new(0),
        })
    }

    fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Entry for TestEntry {
    fn get(&self, projection: &str) -> Result<Arc<Value>, Error> {
        if projection == RAW {
            return Ok(self.data.clone());
        }
        Err(Error::ProjectionNotFound(projection.to_string()))
    }

    async fn stop(&self) {
        if self.stops.fetch_add(1, Ordering::SeqCst) == 0 {
            // Simulate a task that takes a moment to wind down.
            time::sleep(time::Duration::from_millis(1)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[tokio::test]
async fn set_stops_replaced_entry() {
    let running = Arc::new(AtomicUsize::new(0));
    let store = Store::new();

    let first = TestEntry::new(json!("first"), &running);
    store.set("entry", first.clone()).await;
    assert_eq!(store.len(), 1);

    let second = TestEntry::new(json!("second"), &running);
    store.set("entry", second.clone()).await;

    assert_eq!(first.stops(), 1);
    assert_eq!(second.stops(), 0);
    assert_eq!(running.load(Ordering::SeqCst), 1);
    assert_eq!(
        *store.get("entry").expect("entry must exist").get(RAW).unwrap(),
        json!("second")
    );
}

#[tokio::test]
async fn delete_stops_entry() {
    let running = Arc::new(AtomicUsize::new(0));
    let store = Store::new();

    let entry = TestEntry::new(json!(1), &running);
    store.set("entry", entry.clone()).await;

    assert!(store.delete("entry").await);
    assert_eq!(entry.stops(), 1);
    assert!(store.get("entry").is_none());
    assert!(store.is_empty());

    // Deleting an absent name is a no-op.
    assert!(!store.delete("entry").await);
    assert_eq!(entry.stops(), 1);
    assert_eq!(running.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_churn_keeps_one_entry_running() {
    let running = Arc::new(AtomicUsize::new(0));
    let store = Store::new();

    let mut entries = Vec::new();
    let mut tasks = Vec::new();
    for i in 0..32 {
        let entry = TestEntry::new(json!(i), &running);
        entries.push(entry.clone());
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            if i % 5 == 4 {
                store.delete("churn").await;
            }
            store.set("churn", entry).await;
        }));
    }
    for task in tasks {
        task.await.expect("task must not panic");
    }

    assert_eq!(running.load(Ordering::SeqCst), 1);
    let live = entries.iter().filter(|e| e.stops() == 0).count();
    assert_eq!(live, 1, "exactly one entry must remain unstopped");
    assert!(entries.iter().all(|e| e.stops() <= 1));
}

#[tokio::test]
async fn clear_stops_everything() {
    let running = Arc::new(AtomicUsize::new(0));
    let store = Store::new();
    for name in ["a", "b", "c"] {
        store.set(name, TestEntry::new(json!(name), &running)).await;
    }
    assert_eq!(store.names(), vec!["a", "b", "c"]);

    store.clear().await;
    assert!(store.is_empty());
    assert_eq!(running.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn invalid_entry_always_fails() {
    let entry = InvalidEntry::new(Error::sync(anyhow::anyhow!("timed out")));
    for projection in [RAW, "names"] {
        let err = entry.get(projection).expect_err("invalid entry must fail");
        assert!(matches!(err, Error::Sync(_)), "{err}");
        assert!(err.to_string().contains("timed out"));
    }

    // Stopping is a no-op and may be repeated.
    entry.stop().await;
    entry.stop().await;
}

fn names_projection() -> Projections {
    Projections::new(
        vec![Projection {
            name: "names".to_string(),
            expression: "[].metadata.name".to_string(),
        }],
        Arc::new(JmesPath::new()),
    )
}

#[test]
fn projections_compute_together() {
    let snapshot = names_projection()
        .compute(json!([{ "metadata": { "name": "a" } }, { "metadata": { "name": "b" } }]))
        .expect("projections must compute");

    assert_eq!(*snapshot.get("names").unwrap(), json!(["a", "b"]));
    assert_eq!(
        *snapshot.get(RAW).unwrap(),
        json!([{ "metadata": { "name": "a" } }, { "metadata": { "name": "b" } }])
    );
    assert!(matches!(
        snapshot.get("missing"),
        Err(Error::ProjectionNotFound(name)) if name == "missing"
    ));
}

#[test]
fn failed_projection_fails_compute() {
    let projections = Projections::new(
        vec![Projection {
            name: "bad".to_string(),
            expression: "join(',', @)".to_string(),
        }],
        Arc::new(JmesPath::new()),
    );
    let err = projections
        .compute(json!({ "a": "b" }))
        .expect_err("invalid projection must fail");
    assert!(matches!(err, Error::Projection { ref name, .. } if name == "bad"));
}

#[test]
fn recompute_keeps_previous_projection_values() {
    let projections = Projections::new(
        vec![
            Projection {
                name: "first".to_string(),
                expression: "[0]".to_string(),
            },
            Projection {
                name: "joined".to_string(),
                expression: "join(',', @)".to_string(),
            },
        ],
        Arc::new(JmesPath::new()),
    );

    let (previous, errors) = projections.recompute(json!(["x", "y"]), None);
    assert!(errors.is_empty());
    assert_eq!(*previous.get("joined").unwrap(), json!("x,y"));

    // `join` fails on nested arrays; its previous value is retained while `first` is updated.
    let (next, errors) = projections.recompute(json!([["a"], ["b"]]), Some(&previous));
    assert_eq!(errors.len(), 1);
    assert_eq!(*next.get("first").unwrap(), json!(["a"]));
    assert_eq!(*next.get("joined").unwrap(), json!("x,y"));
    assert_eq!(*next.get(RAW).unwrap(), json!([["a"], ["b"]]));
}

#[test]
fn recompute_stores_errors_without_previous_values() {
    let projections = Projections::new(
        vec![Projection {
            name: "joined".to_string(),
            expression: "join(',', @)".to_string(),
        }],
        Arc::new(JmesPath::new()),
    );

    let (snapshot, errors) = projections.recompute(json!([1, 2]), Some(&Snapshot::default()));
    assert_eq!(errors.len(), 1);
    assert_eq!(*snapshot.get(RAW).unwrap(), json!([1, 2]));
    assert!(matches!(
        snapshot.get("joined"),
        Err(Error::Projection { ref name, .. }) if name == "joined"
    ));
    assert!(matches!(
        snapshot.get("missing"),
        Err(Error::ProjectionNotFound(ref name)) if name == "missing"
    ));

    let (next, errors) = projections.recompute(json!([["a"]]), Some(&snapshot));
    assert_eq!(errors.len(), 1);
    assert!(matches!(next.get("joined"), Err(Error::Projection { .. })));

    let (next, errors) = projections.recompute(json!(["a", "b"]), Some(&next));
    assert!(errors.is_empty());
    assert_eq!(*next.get("joined").unwrap(), json!("a,b"));
}

#[test]
fn cached_retains_good_data() {
    let cached = Cached::new(Err(Error::call(anyhow::anyhow!("first call failed"))));
    assert!(!cached.fail(Error::call(anyhow::anyhow!("second call failed"))));
    assert!(cached
        .get(RAW)
        .unwrap_err()
        .to_string()
        .contains("second call failed"));

    cached.update(names_projection().compute(json!([])).unwrap());
    assert_eq!(*cached.get(RAW).unwrap(), json!([]));

    assert!(cached.fail(Error::call(anyhow::anyhow!("third call failed"))));
    assert_eq!(*cached.get("names").unwrap(), json!([]));
}

#[tokio::test]
async fn resolver_reads_entries() {
    let running = Arc::new(AtomicUsize::new(0));
    let store = Store::new();
    store
        .set("deployments-prod", TestEntry::new(json!({ "count": 2 }), &running))
        .await;
    store
        .set(
            "broken",
            InvalidEntry::shared(Error::invalid(anyhow::anyhow!("no such resource"))),
        )
        .await;

    let resolver = Resolver::new(store, Arc::new(JmesPath::new()));
    let vars = json!({ "request": { "namespace": "prod" } });

    let bytes = resolver
        .get("deployments-{{ request.namespace }}", None, &vars)
        .expect("entry must resolve");
    assert_eq!(bytes, br#"{"count":2}"#);

    assert!(matches!(
        resolver.get("deployments-dev", None, &vars),
        Err(resolve::Error::NotFound(name)) if name == "deployments-dev"
    ));
    assert!(matches!(
        resolver.get("broken", None, &vars),
        Err(resolve::Error::Entry { name, source: Error::Invalid(_) }) if name == "broken"
    ));
    assert!(matches!(
        resolver.get("deployments-prod", Some("names"), &vars),
        Err(resolve::Error::Entry { source: Error::ProjectionNotFound(_), .. })
    ));
    assert!(matches!(
        resolver.get("deployments-{{ request.missing }}", None, &vars),
        Err(resolve::Error::Substitute { .. })
    ));

    let mut context = serde_json::Map::new();
    resolver
        .load(
            &mut context,
            &Reference {
                name: "deployments".to_string(),
                entry: "deployments-{{ request.namespace }}".to_string(),
                projection: None,
            },
            &vars,
        )
        .expect("entry must load");
    let expected = btreemap! { "deployments".to_string() => json!({ "count": 2 }) };
    assert_eq!(
        context.into_iter().collect::<std::collections::BTreeMap<_, _>>(),
        expected
    );
}

#[tokio::test]
async fn task_stop_joins_once() {
    let exits = Arc::new(AtomicUsize::new(0));
    let cancel = tokio_util::sync::CancellationToken::new();
    let task = Task::spawn(cancel.clone(), {
        let exits = exits.clone();
        async move {
            cancel.cancelled().await;
            exits.fetch_add(1, Ordering::SeqCst);
        }
    });
    assert!(!task.is_cancelled());

    task.stop().await;
    assert!(task.is_cancelled());
    assert_eq!(exits.load(Ordering::SeqCst), 1);

    task.stop().await;
    assert_eq!(exits.load(Ordering::SeqCst), 1);
}
