use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug)]
pub struct ControllerMetrics {
    reconciles: Family<Labels, Counter>,
    errors: Family<Labels, Counter>,
    conflicts: Family<Labels, Counter>,
}

/// Counters for a single controller.
#[derive(Clone, Debug)]
pub(crate) struct Metrics {
    pub(crate) reconciles: Counter,
    pub(crate) errors: Counter,
    pub(crate) conflicts: Counter,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct Labels {
    controller: &'static str,
}

// === impl ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let reconciles = Family::default();
        reg.register(
            "reconciles",
            "Total number of reconcile passes started",
            reconciles.clone(),
        );

        let errors = Family::default();
        reg.register(
            "reconcile_errors",
            "Total number of reconcile passes that failed and were retried",
            errors.clone(),
        );

        let conflicts = Family::default();
        reg.register(
            "reconcile_conflicts",
            "Total number of reconcile passes abandoned due to a conflicting object",
            conflicts.clone(),
        );

        Self {
            reconciles,
            errors,
            conflicts,
        }
    }

    pub(crate) fn controller(&self, controller: &'static str) -> Metrics {
        let labels = Labels { controller };
        Metrics {
            reconciles: self.reconciles.get_or_create(&labels).clone(),
            errors: self.errors.get_or_create(&labels).clone(),
            conflicts: self.conflicts.get_or_create(&labels).clone(),
        }
    }
}
