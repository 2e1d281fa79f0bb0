//! Global context entries backed by periodic API calls.
//!
//! An [`ExternalEntry`] calls an API once when it is built and then again on every refresh
//! interval, serving the latest successful response and its projections. A failed refresh never
//! discards data from an earlier success.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod api_server;
mod service;


pub use self::{api_server::ApiServerCall, service::HttpCall};
use anyhow::bail;
use context_cache_core::{
    Cached, Entry, Error, Notify, Projections, Reason, Snapshot, Task, Value,
};
use context_cache_k8s_api::{Client, ExternalApiCall, Method};
use std::{sync::Arc, time::Duration};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Executes one API call, returning its JSON response.
#[async_trait::async_trait]
pub trait Call: Send + Sync + 'static {
    async fn call(&self) -> Result<Value, CallError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("request failed: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    #[error("unexpected HTTP status {status}: {body}")]
    Status {
        status: http::StatusCode,
        body: String,
    },

    #[error("response body exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("invalid JSON response: {0}")]
    Json(#[from] serde_json::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Limits applied to every call.
#[derive(Copy, Clone, Debug)]
pub struct Config {
    /// The largest accepted response body. Zero disables the limit.
    pub max_response_length: usize,
    pub timeout: Duration,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Refresh {
    pub interval: Duration,

    /// The number of immediate retries after a failed call.
    pub retry_limit: u32,
}

/// Serves data from an API that is polled in the background.
pub struct ExternalEntry {
    cached: Arc<Cached>,
    task: Task,
}

struct Poller {
    call: Arc<dyn Call>,
    projections: Projections,
    notify: Arc<dyn Notify>,
    cached: Arc<Cached>,
    retry_limit: u32,
    timeout: Duration,
}

/// Builds the executor for a declared call.
pub fn call(
    client: &Client,
    spec: &ExternalApiCall,
    config: Config,
) -> anyhow::Result<Arc<dyn Call>> {
    let body = request_body(spec)?;
    match (spec.url_path.as_deref(), spec.service.as_ref()) {
        (Some(path), None) => Ok(Arc::new(ApiServerCall::new(
            client.clone(),
            spec.method,
            path,
            body,
            config.max_response_length,
        )?)),
        (None, Some(service)) => Ok(Arc::new(HttpCall::new(service, spec.method, body, config)?)),
        _ => bail!("exactly one of urlPath or service must be set"),
    }
}

/// POST requests carry the declared data as a JSON object.
fn request_body(spec: &ExternalApiCall) -> anyhow::Result<Option<Vec<u8>>> {
    if spec.method != Method::Post {
        return Ok(None);
    }
    let data = spec
        .data
        .iter()
        .map(|d| (d.key.clone(), d.value.clone()))
        .collect::<serde_json::Map<_, _>>();
    Ok(Some(serde_json::to_vec(&data)?))
}

fn body_limit(max_response_length: usize) -> usize {
    if max_response_length == 0 {
        usize::MAX
    } else {
        max_response_length
    }
}

/// The number of bytes of an error response that are kept for reporting.
const MAX_ERROR_BODY: usize = 256;

fn status_error(status: http::StatusCode, body: &[u8]) -> CallError {
    let body = String::from_utf8_lossy(&body[..body.len().min(MAX_ERROR_BODY)]);
    CallError::Status {
        status,
        body: body.trim().to_string(),
    }
}

// === impl Refresh ===

impl From<&ExternalApiCall> for Refresh {
    fn from(spec: &ExternalApiCall) -> Self {
        Self {
            interval: spec.refresh_interval.as_duration(),
            retry_limit: spec.retry_limit,
        }
    }
}

// === impl ExternalEntry ===

impl ExternalEntry {
    /// Performs the initial call and starts polling.
    ///
    /// The entry is returned even if the initial call fails; reads then return the failure
    /// until a refresh succeeds.
    pub async fn spawn(
        call: Arc<dyn Call>,
        refresh: Refresh,
        projections: Projections,
        notify: Arc<dyn Notify>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let mut poller = Poller {
            call,
            projections,
            notify,
            cached: Arc::new(Cached::new(Ok(Snapshot::default()))),
            retry_limit: refresh.retry_limit,
            timeout,
        };

        let init = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                Err(Error::call(anyhow::anyhow!("cancelled before the initial call")))
            }
            res = poller.fetch() => res,
        };
        match &init {
            Ok(_) => poller.notify.refreshed(),
            Err(error) => {
                tracing::warn!(%error, "Initial call failed");
                poller.notify.failed(reason(error), error);
            }
        }
        let cached = Arc::new(Cached::new(init));
        poller.cached = cached.clone();

        let task = Task::spawn(
            cancel.clone(),
            poller.run(refresh.interval, cancel).in_current_span(),
        );
        Self { cached, task }
    }
}

#[async_trait::async_trait]
impl Entry for ExternalEntry {
    fn get(&self, projection: &str) -> Result<Arc<Value>, Error> {
        self.cached.get(projection)
    }

    async fn stop(&self) {
        self.task.stop().await;
    }
}

impl std::fmt::Debug for ExternalEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalEntry")
            .field("cached", &self.cached)
            .field("stopped", &self.task.is_cancelled())
            .finish()
    }
}

fn reason(error: &Error) -> Reason {
    match error {
        Error::Projection { .. } => Reason::ProjectionFailed,
        _ => Reason::ApiCallFailed,
    }
}

// === impl Poller ===

impl Poller {
    async fn run(self, interval: Duration, cancel: CancellationToken) {
        let mut timer = time::interval_at(Instant::now() + interval, interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                result = async {
                    timer.tick().await;
                    self.fetch().await
                } => result,
            };

            match result {
                Ok(snapshot) => {
                    tracing::debug!("Refreshed");
                    self.cached.update(snapshot);
                    self.notify.refreshed();
                }
                Err(error) => {
                    let retained = self.cached.fail(error.clone());
                    tracing::warn!(%error, retained, "Refresh failed");
                    self.notify.failed(reason(&error), &error);
                }
            }
        }
        tracing::debug!("Stopped");
    }

    /// Calls the API, retrying failures up to the retry limit, and computes projections.
    async fn fetch(&self) -> Result<Snapshot, Error> {
        let mut attempt = 0;
        let raw = loop {
            let result = match time::timeout(self.timeout, self.call.call()).await {
                Ok(result) => result,
                Err(_) => Err(CallError::Timeout(self.timeout)),
            };
            match result {
                Ok(raw) => break raw,
                Err(error) if attempt < self.retry_limit => {
                    attempt += 1;
                    tracing::debug!(%error, attempt, "Retrying call");
                }
                Err(error) => return Err(Error::call(error)),
            }
        };
        self.projections.compute(raw)
    }
}
