use crate::{
    metrics::{ControllerMetrics, Outcome},
    validation::{self, Source},
    SharedIndex, WorkQueue,
};
use anyhow::Context;
use context_cache_core::{
    Entry, Error, Evaluate, InvalidEntry, Notify, Projection, Projections, Reason, Store,
};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument};

/// Constructs live entries from validated specs.
#[async_trait::async_trait]
pub trait BuildEntry: Send + Sync + 'static {
    /// Returns the notification sink for the named entry. `source` is `None` when the entry's spec
    /// is invalid.
    fn notify(&self, name: &str, source: Option<Source<'_>>) -> Arc<dyn Notify>;

    /// Starts the entry's data source.
    ///
    /// Failures that should be retried are returned as errors. Failures that retrying cannot fix
    /// should instead be returned as an [`InvalidEntry`].
    async fn build(
        &self,
        name: &str,
        source: Source<'_>,
        projections: Projections,
        notify: Arc<dyn Notify>,
        cancel: CancellationToken,
    ) -> anyhow::Result<Arc<dyn Entry>>;
}

/// Keeps the store consistent with the declared entries.
pub struct Controller<B> {
    index: SharedIndex,
    queue: WorkQueue,
    store: Store,
    builder: Arc<B>,
    evaluator: Arc<dyn Evaluate>,
    max_retries: u32,
    metrics: ControllerMetrics,
}

// === impl Controller ===

impl<B: BuildEntry> Controller<B> {
    pub fn new(
        index: SharedIndex,
        queue: WorkQueue,
        store: Store,
        builder: B,
        evaluator: Arc<dyn Evaluate>,
        max_retries: u32,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            index,
            queue,
            store,
            builder: Arc::new(builder),
            evaluator,
            max_retries,
            metrics,
        }
    }

    /// Runs `workers` reconcile loops until `shutdown` fires, then stops every entry.
    pub async fn run(self, workers: usize, shutdown: CancellationToken) {
        let mut tasks = JoinSet::new();
        for id in 0..workers.max(1) {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(
                async move { worker.work(shutdown).await }.instrument(info_span!("worker", id)),
            );
        }

        shutdown.cancelled().await;
        tracing::debug!("Shutting down");
        self.queue.shutdown();
        while let Some(res) = tasks.join_next().await {
            if let Err(error) = res {
                tracing::error!(%error, "Worker failed");
            }
        }

        self.store.clear().await;
        tracing::debug!("Stopped all entries");
    }

    async fn work(self, shutdown: CancellationToken) {
        while let Some(name) = self.queue.get().await {
            self.process(&name, &shutdown)
                .instrument(info_span!("entry", %name))
                .await;
            self.queue.done(&name);
        }
    }

    async fn process(&self, name: &str, shutdown: &CancellationToken) {
        match self.reconcile(name, shutdown.child_token()).await {
            Ok(outcome) => {
                self.queue.forget(name);
                self.metrics.record(outcome);
            }

            Err(error) if shutdown.is_cancelled() => {
                tracing::debug!(error = %format_args!("{error:#}"), "Abandoned during shutdown");
            }

            Err(error) => {
                let retries = self.queue.num_requeues(name);
                if retries < self.max_retries {
                    tracing::warn!(retries, error = %format_args!("{error:#}"), "Failed to reconcile");
                    self.queue.add_rate_limited(name.to_string());
                    self.metrics.record(Outcome::Requeued);
                    return;
                }

                tracing::error!(retries, error = %format_args!("{error:#}"), "Dropping entry");
                self.queue.forget(name);
                let spec = self.index.read().get(name);
                let source = spec
                    .as_deref()
                    .and_then(|spec| validation::validate(name, spec, &*self.evaluator).ok());
                self.builder
                    .notify(name, source)
                    .failed(Reason::BuildFailed, &Error::invalid(error));
                self.metrics.record(Outcome::Dropped);
            }
        }
    }

    async fn reconcile(&self, name: &str, cancel: CancellationToken) -> anyhow::Result<Outcome> {
        let spec = self.index.read().get(name);
        let Some(spec) = spec else {
            if self.store.delete(name).await {
                tracing::info!("Deleted");
            }
            self.builder.notify(name, None).deleted();
            return Ok(Outcome::Deleted);
        };

        let source = match validation::validate(name, &spec, &*self.evaluator) {
            Ok(source) => source,
            Err(error) => {
                tracing::warn!(%error, "Invalid entry");
                let error = Error::invalid(error);
                self.builder
                    .notify(name, None)
                    .failed(Reason::BuildFailed, &error);
                self.store.set(name, InvalidEntry::shared(error)).await;
                return Ok(Outcome::Invalid);
            }
        };

        let notify = self.builder.notify(name, Some(source));
        let projections = Projections::new(
            spec.projections.iter().map(|p| Projection {
                name: p.name.clone(),
                expression: p.jmes_path.clone(),
            }),
            self.evaluator.clone(),
        );
        let entry = self
            .builder
            .build(name, source, projections, notify, cancel)
            .await
            .with_context(|| format!("failed to build entry {name}"))?;

        self.store.set(name, entry).await;
        tracing::info!("Installed");
        Ok(Outcome::Installed)
    }
}

impl<B> Clone for Controller<B> {
    fn clone(&self) -> Self {
        Self {
            index: self.index.clone(),
            queue: self.queue.clone(),
            store: self.store.clone(),
            builder: self.builder.clone(),
            evaluator: self.evaluator.clone(),
            max_retries: self.max_retries,
            metrics: self.metrics.clone(),
        }
    }
}
