use std::future::Future;
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;

/// An entry's background task.
///
/// Stopping cancels the task's token and waits for the task to exit. Only the first call to
/// [`Task::stop`] waits; later calls return once the task has been joined.
#[derive(Debug)]
pub struct Task {
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Task {
    /// Spawns `run` with `cancel`, which the future is expected to observe.
    pub fn spawn<F>(cancel: CancellationToken, run: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            cancel,
            handle: Mutex::new(Some(tokio::spawn(run))),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let mut handle = self.handle.lock().await;
        if let Some(handle) = handle.take() {
            if let Err(error) = handle.await {
                tracing::error!(%error, "Entry task failed");
            }
        }
    }
}
