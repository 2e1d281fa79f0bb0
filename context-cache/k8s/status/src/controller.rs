use crate::{ControllerMetrics, Kind, Update, STATUS_CONTROLLER_NAME};
use ahash::AHashMap as HashMap;
use chrono::{SecondsFormat, Utc};
use context_cache_core::Reason;
use context_cache_k8s_api::{self as k8s, GlobalContextEntry, ObjectReference, Resource};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kubert::lease::Claim;
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    time,
};

const MAX_BATCH: usize = 64;
const MAX_NOTE_LEN: usize = 1024;

/// Publishes events and status patches for entry updates.
pub struct Controller {
    claims: watch::Receiver<Arc<Claim>>,
    client: k8s::Client,
    name: String,
    updates: mpsc::Receiver<Update>,
    patch_timeout: Duration,
    metrics: ControllerMetrics,
    recorder: Recorder,
    conditions: HashMap<String, Ready>,
}

/// The last known `Ready` condition of an entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Ready {
    pub(crate) ready: bool,
    pub(crate) reason: &'static str,
    pub(crate) message: String,
    pub(crate) since: String,
    pub(crate) refreshed: Option<String>,
}

impl Controller {
    pub fn new(
        claims: watch::Receiver<Arc<Claim>>,
        client: k8s::Client,
        name: String,
        updates: mpsc::Receiver<Update>,
        patch_timeout: Duration,
        metrics: ControllerMetrics,
    ) -> Self {
        let recorder = Recorder::new(
            client.clone(),
            Reporter {
                controller: STATUS_CONTROLLER_NAME.to_string(),
                instance: Some(name.clone()),
            },
        );
        Self {
            claims,
            client,
            name,
            updates,
            patch_timeout,
            metrics,
            recorder,
            conditions: HashMap::default(),
        }
    }

    /// Processes updates until every [`crate::Notifier`] has been dropped.
    ///
    /// Updates are handled in batches so that an entry that refreshes frequently is patched at
    /// most once per batch.
    pub async fn run(mut self) {
        let mut batch = Vec::with_capacity(MAX_BATCH);
        while self.updates.recv_many(&mut batch, MAX_BATCH).await > 0 {
            self.process(batch.drain(..)).await;
        }
        tracing::debug!("Status updates closed");
    }

    pub(crate) async fn process(&mut self, updates: impl IntoIterator<Item = Update>) {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

        let mut changed = Vec::<String>::new();
        for Update { name, kind } in updates {
            if let Kind::Failed { reason, message } = &kind {
                self.publish(&name, *reason, message).await;
            }
            match transition(self.conditions.get(&name), &kind, &now) {
                Some(ready) => {
                    self.conditions.insert(name.clone(), ready);
                    if !changed.contains(&name) {
                        changed.push(name);
                    }
                }
                None => {
                    self.conditions.remove(&name);
                    changed.retain(|n| *n != name);
                }
            }
        }

        if !self.claims.borrow().is_current_for(&self.name) {
            tracing::debug!(updates = changed.len(), "Not the leader; skipping patches");
            for _ in &changed {
                self.metrics.skipped();
            }
            return;
        }
        for name in changed {
            self.patch(&name).await;
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked(&self) -> usize {
        self.conditions.len()
    }

    async fn publish(&self, name: &str, reason: Reason, message: &str) {
        let event = Event {
            type_: EventType::Warning,
            reason: reason.as_str().to_string(),
            note: Some(note(message)),
            action: action(reason).to_string(),
            secondary: None,
        };
        let reference = object_ref(name);
        match time::timeout(self.patch_timeout, self.recorder.publish(&event, &reference)).await {
            Ok(Ok(())) => self.metrics.published(reason, "ok"),
            Ok(Err(error)) => {
                tracing::warn!(%name, %error, "Failed to publish event");
                self.metrics.published(reason, "error");
            }
            Err(_) => {
                tracing::warn!(%name, timeout = ?self.patch_timeout, "Timed out publishing event");
                self.metrics.published(reason, "timeout");
            }
        }
    }

    async fn patch(&mut self, name: &str) {
        let patch = match self.conditions.get(name) {
            Some(ready) => k8s::Patch::Merge(status_patch(ready)),
            None => return,
        };
        let api = k8s::Api::<GlobalContextEntry>::all(self.client.clone());
        let params = k8s::PatchParams::apply(STATUS_CONTROLLER_NAME);
        match time::timeout(self.patch_timeout, api.patch_status(name, &params, &patch)).await {
            Ok(Ok(_)) => {
                tracing::debug!(%name, "Patched status");
                self.metrics.patched("ok");
            }
            Ok(Err(k8s::Error::Api(rsp))) if rsp.code == 404 => {
                tracing::debug!(%name, "Entry no longer exists");
                self.conditions.remove(name);
                self.metrics.patched("not_found");
            }
            Ok(Err(error)) => {
                tracing::warn!(%name, %error, "Failed to patch status");
                self.metrics.patched("error");
            }
            Err(_) => {
                tracing::warn!(%name, timeout = ?self.patch_timeout, "Timed out patching status");
                self.metrics.patched("timeout");
            }
        }
    }
}

/// Applies an update to an entry's last known condition, returning `None` once the entry is
/// deleted. The transition time only moves when readiness flips.
pub(crate) fn transition(prior: Option<&Ready>, kind: &Kind, now: &str) -> Option<Ready> {
    let (ready, reason, message) = match kind {
        Kind::Refreshed => (true, "Succeeded", "Data refreshed".to_string()),
        Kind::Failed { reason, message } => (false, reason.as_str(), message.clone()),
        Kind::Deleted => return None,
    };
    let since = match prior {
        Some(prior) if prior.ready == ready => prior.since.clone(),
        _ => now.to_string(),
    };
    let refreshed = if ready {
        Some(now.to_string())
    } else {
        prior.and_then(|p| p.refreshed.clone())
    };
    Some(Ready {
        ready,
        reason,
        message,
        since,
        refreshed,
    })
}

pub(crate) fn status_patch(ready: &Ready) -> serde_json::Value {
    let mut status = json!({
        "conditions": [{
            "type": "Ready",
            "status": if ready.ready { "True" } else { "False" },
            "reason": ready.reason,
            "message": ready.message,
            "lastTransitionTime": ready.since,
        }],
    });
    if let Some(refreshed) = &ready.refreshed {
        status["lastRefreshTime"] = json!(refreshed);
    }
    json!({ "status": status })
}

fn action(reason: Reason) -> &'static str {
    match reason {
        Reason::BuildFailed => "Build",
        Reason::SyncFailed | Reason::WatchFailed => "Watch",
        Reason::ApiCallFailed | Reason::ProjectionFailed => "Refresh",
    }
}

pub(crate) fn note(message: &str) -> String {
    if message.len() <= MAX_NOTE_LEN {
        return message.to_string();
    }
    let mut end = MAX_NOTE_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &message[..end])
}

fn object_ref(name: &str) -> ObjectReference {
    ObjectReference {
        api_version: Some(GlobalContextEntry::api_version(&()).into_owned()),
        kind: Some(GlobalContextEntry::kind(&()).into_owned()),
        name: Some(name.to_string()),
        ..Default::default()
    }
}
