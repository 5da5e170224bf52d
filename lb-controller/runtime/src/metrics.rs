use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::{Registry, Unit},
};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct ReconcileMetrics {
    total: Family<OutcomeLabels, Counter>,
    duration: Family<KindLabels, Histogram>,
}

/// Metrics for a single resource kind.
#[derive(Clone, Debug)]
pub(crate) struct KindMetrics {
    success: Counter,
    failure: Counter,
    cancelled: Counter,
    duration: Histogram,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    Success,
    Failure,
    Cancelled,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct OutcomeLabels {
    kind: &'static str,
    outcome: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct KindLabels {
    kind: &'static str,
}

// === impl ReconcileMetrics ===

impl ReconcileMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let total = Family::<OutcomeLabels, Counter>::default();
        reg.register(
            "reconcile",
            "Total number of reconcile passes by outcome",
            total.clone(),
        );

        let duration = Family::<KindLabels, Histogram>::new_with_constructor(|| {
            Histogram::new([0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0])
        });
        reg.register_with_unit(
            "reconcile_duration",
            "Time taken by reconcile passes",
            Unit::Seconds,
            duration.clone(),
        );

        Self { total, duration }
    }

    pub(crate) fn kind(&self, kind: &'static str) -> KindMetrics {
        let outcome = |outcome: Outcome| {
            self.total
                .get_or_create(&OutcomeLabels {
                    kind,
                    outcome: outcome.as_str(),
                })
                .clone()
        };
        KindMetrics {
            success: outcome(Outcome::Success),
            failure: outcome(Outcome::Failure),
            cancelled: outcome(Outcome::Cancelled),
            duration: self.duration.get_or_create(&KindLabels { kind }).clone(),
        }
    }
}

// === impl KindMetrics ===

impl KindMetrics {
    pub(crate) fn record(&self, outcome: Outcome, elapsed: Duration) {
        let counter = match outcome {
            Outcome::Success => &self.success,
            Outcome::Failure => &self.failure,
            Outcome::Cancelled => &self.cancelled,
        };
        counter.inc();
        self.duration.observe(elapsed.as_secs_f64());
    }
}

// === impl Outcome ===

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Cancelled => "cancelled",
        }
    }
}
