use crate::NotifyMetrics;
use context_cache_core::{Error, Notify, Reason};
use tokio::sync::mpsc::{self, error::TrySendError};

/// A change in an entry's health.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Update {
    pub name: String,
    pub kind: Kind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Kind {
    Refreshed,
    Failed { reason: Reason, message: String },
    Deleted,
}

/// Forwards an entry's notifications to the status controller.
///
/// Notifications are never allowed to block an entry's refresh loop: when the controller falls
/// behind, updates are dropped.
#[derive(Clone, Debug)]
pub struct Notifier {
    name: String,
    source: &'static str,
    updates: mpsc::Sender<Update>,
    metrics: NotifyMetrics,
}

impl Notifier {
    /// `source` names the kind of data source backing the entry, for metrics.
    pub fn new(
        name: impl Into<String>,
        source: &'static str,
        updates: mpsc::Sender<Update>,
        metrics: NotifyMetrics,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            updates,
            metrics,
        }
    }

    fn send(&self, kind: Kind) {
        let update = Update {
            name: self.name.clone(),
            kind,
        };
        match self.updates.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(update)) => {
                tracing::warn!(name = %update.name, "Status update queue is full; dropping update");
                self.metrics.dropped();
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(name = %self.name, "Status controller has stopped");
            }
        }
    }
}

impl Notify for Notifier {
    fn refreshed(&self) {
        self.metrics.refreshed(self.source);
        self.send(Kind::Refreshed);
    }

    fn failed(&self, reason: Reason, error: &Error) {
        self.metrics.failed(self.source, reason);
        self.send(Kind::Failed {
            reason,
            message: error.to_string(),
        });
    }

    fn deleted(&self) {
        self.send(Kind::Deleted);
    }
}
