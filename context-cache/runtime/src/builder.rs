use crate::{
    controller::{BuildEntry, Source},
    core::{Entry, Error, InvalidEntry, Notify, Projections, Reason},
    external::{self, ExternalEntry, Refresh},
    k8s::Client,
    resource::ResourceEntry,
    status,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument};

/// Builds resource mirrors and API pollers that report to the status controller.
pub(crate) struct EntryBuilder {
    pub(crate) client: Client,
    pub(crate) updates: mpsc::Sender<status::Update>,
    pub(crate) metrics: status::NotifyMetrics,
    pub(crate) calls: external::Config,
    pub(crate) sync_timeout: Duration,
}

#[async_trait::async_trait]
impl BuildEntry for EntryBuilder {
    fn notify(&self, name: &str, source: Option<Source<'_>>) -> Arc<dyn Notify> {
        let source = match source {
            Some(Source::Resource(_)) => "kubernetesResource",
            Some(Source::ApiCall(_)) => "apiCall",
            None => "invalid",
        };
        Arc::new(status::Notifier::new(
            name,
            source,
            self.updates.clone(),
            self.metrics.clone(),
        ))
    }

    async fn build(
        &self,
        _name: &str,
        source: Source<'_>,
        projections: Projections,
        notify: Arc<dyn Notify>,
        cancel: CancellationToken,
    ) -> anyhow::Result<Arc<dyn Entry>> {
        match source {
            Source::Resource(resource) => {
                ResourceEntry::watch(
                    self.client.clone(),
                    resource,
                    projections,
                    notify,
                    self.sync_timeout,
                    cancel,
                )
                .instrument(info_span!("watch", %resource))
                .await
            }

            Source::ApiCall(call) => {
                // Calls that cannot be constructed won't succeed on retry.
                let executor = match external::call(&self.client, call, self.calls) {
                    Ok(executor) => executor,
                    Err(error) => {
                        let error = Error::invalid(error);
                        notify.failed(Reason::BuildFailed, &error);
                        return Ok(InvalidEntry::shared(error));
                    }
                };
                let entry = ExternalEntry::spawn(
                    executor,
                    Refresh::from(call),
                    projections,
                    notify,
                    self.calls.timeout,
                    cancel,
                )
                .instrument(info_span!("poll"))
                .await;
                Ok(Arc::new(entry))
            }
        }
    }
}
