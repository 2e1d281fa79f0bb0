use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc};
use tokio::{sync::Notify, time};

const BASE_DELAY: time::Duration = time::Duration::from_millis(5);
const MAX_DELAY: time::Duration = time::Duration::from_secs(1000);

/// A queue of object names awaiting reconciliation.
///
/// A name is queued at most once; a name that is re-added while a worker holds it is handed out
/// again only after the worker calls [`WorkQueue::done`]. Failed names may be re-added after an
/// exponential per-name delay.
#[derive(Clone, Debug, Default)]
pub struct WorkQueue(Arc<Inner>);

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    ready: Notify,
}

#[derive(Debug, Default)]
struct State {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shutdown: bool,
}

// === impl WorkQueue ===

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, name: impl Into<String>) {
        let name = name.into();
        let mut state = self.0.state.lock();
        if state.shutdown || !state.dirty.insert(name.clone()) {
            return;
        }
        if state.processing.contains(&name) {
            return;
        }
        state.queue.push_back(name);
        drop(state);
        self.0.ready.notify_one();
    }

    /// Waits for the next name. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.0.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.0.state.lock();
                if state.shutdown {
                    return None;
                }
                if let Some(name) = state.queue.pop_front() {
                    state.dirty.remove(&name);
                    state.processing.insert(name.clone());
                    return Some(name);
                }
            }

            notified.await;
        }
    }

    /// Marks a name handed out by [`WorkQueue::get`] as processed.
    pub fn done(&self, name: &str) {
        let mut state = self.0.state.lock();
        state.processing.remove(name);
        if state.dirty.contains(name) {
            state.queue.push_back(name.to_string());
            drop(state);
            self.0.ready.notify_one();
        }
    }

    /// Re-adds `name` after a delay that doubles with each consecutive failure.
    pub fn add_rate_limited(&self, name: String) {
        let delay = {
            let mut state = self.0.state.lock();
            if state.shutdown {
                return;
            }
            let failures = state.failures.entry(name.clone()).or_default();
            let delay = backoff(*failures);
            *failures += 1;
            delay
        };
        tracing::debug!(%name, ?delay, "Requeueing");

        let queue = self.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            queue.add(name);
        });
    }

    /// Returns the number of times `name` has been rate-limited since it was last forgotten.
    pub fn num_requeues(&self, name: &str) -> u32 {
        self.0
            .state
            .lock()
            .failures
            .get(name)
            .copied()
            .unwrap_or_default()
    }

    /// Resets the backoff of `name`.
    pub fn forget(&self, name: &str) {
        self.0.state.lock().failures.remove(name);
    }

    pub fn len(&self) -> usize {
        self.0.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops handing out names and wakes every waiting worker.
    pub fn shutdown(&self) {
        self.0.state.lock().shutdown = true;
        self.0.ready.notify_waiters();
    }
}

fn backoff(failures: u32) -> time::Duration {
    // 5ms * 2^18 already exceeds the maximum.
    if failures >= 18 {
        return MAX_DELAY;
    }
    (BASE_DELAY * (1u32 << failures)).min(MAX_DELAY)
}
