use context_cache_core::Reason;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct NotifyMetrics {
    refreshes: Family<RefreshLabels, Counter>,
    dropped: Counter,
}

#[derive(Clone, Debug, Default)]
pub struct ControllerMetrics {
    patches: Family<PatchLabels, Counter>,
    events: Family<EventLabels, Counter>,
    skipped: Counter,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RefreshLabels {
    source: &'static str,
    result: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct PatchLabels {
    result: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct EventLabels {
    reason: &'static str,
    result: &'static str,
}

// === impl NotifyMetrics ===

impl NotifyMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let refreshes = Family::<RefreshLabels, Counter>::default();
        reg.register(
            "refreshes",
            "Total number of entry refreshes by data source and result",
            refreshes.clone(),
        );

        let dropped = Counter::default();
        reg.register(
            "dropped_updates",
            "Total number of status updates dropped because the queue was full",
            dropped.clone(),
        );

        Self { refreshes, dropped }
    }

    pub(crate) fn refreshed(&self, source: &'static str) {
        self.refreshes
            .get_or_create(&RefreshLabels {
                source,
                result: "ok",
            })
            .inc();
    }

    pub(crate) fn failed(&self, source: &'static str, reason: Reason) {
        self.refreshes
            .get_or_create(&RefreshLabels {
                source,
                result: reason.as_str(),
            })
            .inc();
    }

    pub(crate) fn dropped(&self) {
        self.dropped.inc();
    }

    #[cfg(test)]
    pub(crate) fn dropped_count(&self) -> u64 {
        self.dropped.get()
    }
}

// === impl ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let patches = Family::<PatchLabels, Counter>::default();
        reg.register(
            "patches",
            "Total number of status patches by result",
            patches.clone(),
        );

        let events = Family::<EventLabels, Counter>::default();
        reg.register(
            "events",
            "Total number of published events by reason and result",
            events.clone(),
        );

        let skipped = Counter::default();
        reg.register(
            "skipped_patches",
            "Total number of status patches skipped because the write lease is held elsewhere",
            skipped.clone(),
        );

        Self {
            patches,
            events,
            skipped,
        }
    }

    pub(crate) fn patched(&self, result: &'static str) {
        self.patches.get_or_create(&PatchLabels { result }).inc();
    }

    pub(crate) fn published(&self, reason: Reason, result: &'static str) {
        self.events
            .get_or_create(&EventLabels {
                reason: reason.as_str(),
                result,
            })
            .inc();
    }

    pub(crate) fn skipped(&self) {
        self.skipped.inc();
    }
}
