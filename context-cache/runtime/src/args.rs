use crate::{
    admission::Admission,
    builder::EntryBuilder,
    controller::{self, Controller, ControllerMetrics, Index, WorkQueue},
    core::{Evaluate, JmesPath, Store},
    external,
    k8s::GlobalContextEntry,
    lease, status,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::{sync::mpsc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "context-cache", about = "A global context cache controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "context_cache=info,warn",
        env = "CONTEXT_CACHE_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the admission controller server.
    #[clap(long)]
    admission_controller_disabled: bool,

    /// The number of entries reconciled concurrently.
    #[clap(long, default_value = "2")]
    workers: usize,

    /// The number of times a failed entry build is retried before it is dropped.
    #[clap(long, default_value = "10")]
    max_retries: u32,

    /// The largest accepted API call response, in bytes. Zero disables the limit.
    #[clap(long, default_value = "2000000")]
    max_api_call_response_length: usize,

    #[clap(long, default_value = "10000")]
    api_call_timeout_ms: u64,

    /// How long a resource entry may take to list its resources before it is marked invalid.
    #[clap(long, default_value = "30000")]
    cache_sync_timeout_ms: u64,

    /// The maximum number of status updates to buffer.
    #[clap(long, default_value = "1024")]
    event_queue_size: usize,

    #[clap(long, default_value = "kyverno-context-cache")]
    controller_deployment_name: String,

    #[clap(long, default_value = "kyverno")]
    controller_namespace: String,

    #[clap(long, default_value = "5000")]
    patch_timeout_ms: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            admission_controller_disabled,
            workers,
            max_retries,
            max_api_call_response_length,
            api_call_timeout_ms,
            cache_sync_timeout_ms,
            event_queue_size,
            controller_deployment_name,
            controller_namespace,
            patch_timeout_ms,
        } = self;

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };

        let evaluator: Arc<dyn Evaluate> = Arc::new(JmesPath::new());
        let store = Store::new();
        let queue = WorkQueue::new();
        let index = Index::shared(queue.clone());

        let mut prom = <Registry>::default();
        let controller_metrics =
            ControllerMetrics::register(prom.sub_registry_with_prefix("controller"));
        controller::register_sizes(
            prom.sub_registry_with_prefix("cache"),
            store.clone(),
            index.clone(),
            queue.clone(),
        );
        let notify_metrics = status::NotifyMetrics::register(prom.sub_registry_with_prefix("entry"));
        let status_metrics =
            status::ControllerMetrics::register(prom.sub_registry_with_prefix("resource_status"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        let hostname =
            std::env::var("HOSTNAME").context("failed to fetch `HOSTNAME` environment variable")?;

        let claims = lease::init(
            &runtime,
            &controller_namespace,
            &controller_deployment_name,
            &hostname,
        )
        .await?;

        // Entries report their health to the status controller, which publishes events and
        // patches the status of each GlobalContextEntry.
        let (updates_tx, updates_rx) = mpsc::channel(event_queue_size);
        let status_controller = status::Controller::new(
            claims,
            runtime.client(),
            hostname,
            updates_rx,
            Duration::from_millis(patch_timeout_ms),
            status_metrics,
        );
        tokio::spawn(
            status_controller
                .run()
                .instrument(info_span!("status_controller")),
        );

        let entries = runtime.watch_all::<GlobalContextEntry>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(index.clone(), entries)
                .instrument(info_span!("globalcontextentries")),
        );

        let builder = EntryBuilder {
            client: runtime.client(),
            updates: updates_tx,
            metrics: notify_metrics,
            calls: external::Config {
                max_response_length: max_api_call_response_length,
                timeout: Duration::from_millis(api_call_timeout_ms),
            },
            sync_timeout: Duration::from_millis(cache_sync_timeout_ms),
        };
        let controller = Controller::new(
            index,
            queue,
            store,
            builder,
            evaluator.clone(),
            max_retries,
            controller_metrics,
        );

        // Entries are stopped before the process is allowed to exit.
        let shutdown = CancellationToken::new();
        let controller = tokio::spawn(
            controller
                .run(workers, shutdown.clone())
                .instrument(info_span!("controller")),
        );
        let drain = runtime.shutdown_handle();
        tokio::spawn(async move {
            let release = drain.signaled().await;
            shutdown.cancel();
            if let Err(error) = release.release_after(controller).await {
                tracing::error!(%error, "Controller failed");
            }
        });

        let runtime = runtime.spawn_server(move || Admission::new(evaluator));

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
