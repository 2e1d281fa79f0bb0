use crate::{SharedIndex, WorkQueue};
use context_cache_core::Store;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeLabelSet, EncodeMetric},
    metrics::{counter::Counter, family::Family, gauge::ConstGauge, MetricType},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct ControllerMetrics {
    reconciles: Family<ReconcileLabels, Counter>,
}

/// The outcome of reconciling one name.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub(crate) enum Outcome {
    Installed,
    Deleted,
    Invalid,
    Requeued,
    Dropped,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ReconcileLabels {
    result: &'static str,
}

#[derive(Debug)]
struct Instrumented {
    store: Store,
    index: SharedIndex,
    queue: WorkQueue,
}

// === impl ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let reconciles = Family::<ReconcileLabels, Counter>::default();
        reg.register(
            "reconciles",
            "Total number of global context entry reconciliations by result",
            reconciles.clone(),
        );
        Self { reconciles }
    }

    pub(crate) fn record(&self, outcome: Outcome) {
        self.reconciles
            .get_or_create(&ReconcileLabels {
                result: outcome.as_str(),
            })
            .inc();
    }

    #[cfg(test)]
    pub(crate) fn count(&self, outcome: Outcome) -> u64 {
        self.reconciles
            .get_or_create(&ReconcileLabels {
                result: outcome.as_str(),
            })
            .get()
    }
}

/// Exports the sizes of the store, the index and the work queue as gauges.
pub fn register_sizes(reg: &mut Registry, store: Store, index: SharedIndex, queue: WorkQueue) {
    reg.register_collector(Box::new(Instrumented {
        store,
        index,
        queue,
    }));
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Installed => "installed",
            Self::Deleted => "deleted",
            Self::Invalid => "invalid",
            Self::Requeued => "requeued",
            Self::Dropped => "dropped",
        }
    }
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let store = encoder.encode_descriptor(
            "store_size",
            "The number of entries in the cache",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(self.store.len() as i64).encode(store)?;

        let index = encoder.encode_descriptor(
            "index_size",
            "The number of declared global context entries",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(self.index.read().len() as i64).encode(index)?;

        let queue = encoder.encode_descriptor(
            "queue_depth",
            "The number of entries awaiting reconciliation",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(self.queue.len() as i64).encode(queue)?;

        Ok(())
    }
}
