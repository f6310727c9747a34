//! Metrics for certificator observability
//!
//! The reconciler reports through the [`Observer`] trait and never reads
//! anything back. [`Metrics`] is the production implementation, backed by
//! OpenTelemetry instruments created from an explicit [`Meter`]; the instance
//! is handed to the reconciler rather than living in a process-wide static.

use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;

/// Outcome label for refresh and apply counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The attempt succeeded
    Success,
    /// The attempt failed
    Failure,
}

impl Outcome {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }

    /// Build an outcome from a success flag
    pub fn from_success(success: bool) -> Self {
        if success {
            Self::Success
        } else {
            Self::Failure
        }
    }
}

/// Sink for reconciler observations
///
/// Gauges are point-in-time values; counters are monotonic.
pub trait Observer: Send + Sync {
    /// Number of namespaces the bundle is distributed to
    fn set_namespaces(&self, count: usize);

    /// Number of namespaces lacking the latest bundle
    fn set_pending_namespaces(&self, count: usize);

    /// Number of certificates in the published bundle
    fn set_certificates(&self, count: usize);

    /// One bundle refresh attempt finished
    fn record_refresh(&self, outcome: Outcome);

    /// One artifact apply attempt finished
    fn record_apply(&self, outcome: Outcome);
}

/// Observer that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn set_namespaces(&self, _count: usize) {}
    fn set_pending_namespaces(&self, _count: usize) {}
    fn set_certificates(&self, _count: usize) {}
    fn record_refresh(&self, _outcome: Outcome) {}
    fn record_apply(&self, _outcome: Outcome) {}
}

/// OpenTelemetry backed observer
pub struct Metrics {
    namespaces: Gauge<u64>,
    pending_namespaces: Gauge<u64>,
    certificates: Gauge<u64>,
    refreshes: Counter<u64>,
    applies: Counter<u64>,
}

impl Metrics {
    /// Create all instruments on the given meter
    pub fn new(meter: &Meter) -> Self {
        let metrics = Self {
            namespaces: meter
                .u64_gauge("certificator_namespaces_total")
                .with_description("Number of namespaces certificator saves CA bundles into")
                .with_unit("{namespaces}")
                .build(),
            pending_namespaces: meter
                .u64_gauge("certificator_namespaces_pending")
                .with_description("Number of namespaces lacking the latest CA bundle")
                .with_unit("{namespaces}")
                .build(),
            certificates: meter
                .u64_gauge("certificator_certificates")
                .with_description("Number of CA certificates in the bundle")
                .with_unit("{certificates}")
                .build(),
            refreshes: meter
                .u64_counter("certificator_refreshes_total")
                .with_description("Certificate bundle refreshes attempted")
                .with_unit("{refreshes}")
                .build(),
            applies: meter
                .u64_counter("certificator_applies_total")
                .with_description("ConfigMap applies attempted")
                .with_unit("{applies}")
                .build(),
        };

        metrics.namespaces.record(0, &[]);
        metrics.pending_namespaces.record(0, &[]);
        metrics.certificates.record(0, &[]);
        metrics
    }

    /// Create instruments on the global meter provider
    pub fn global() -> Self {
        Self::new(&opentelemetry::global::meter("certificator"))
    }
}

fn outcome_labels(outcome: Outcome) -> [KeyValue; 1] {
    [KeyValue::new("outcome", outcome.as_str())]
}

impl Observer for Metrics {
    fn set_namespaces(&self, count: usize) {
        self.namespaces.record(count as u64, &[]);
    }

    fn set_pending_namespaces(&self, count: usize) {
        self.pending_namespaces.record(count as u64, &[]);
    }

    fn set_certificates(&self, count: usize) {
        self.certificates.record(count as u64, &[]);
    }

    fn record_refresh(&self, outcome: Outcome) {
        self.refreshes.add(1, &outcome_labels(outcome));
    }

    fn record_apply(&self, outcome: Outcome) {
        self.applies.add(1, &outcome_labels(outcome));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_labels() {
        assert_eq!(Outcome::Success.as_str(), "success");
        assert_eq!(Outcome::Failure.as_str(), "failure");
        assert_eq!(Outcome::from_success(true), Outcome::Success);
        assert_eq!(Outcome::from_success(false), Outcome::Failure);
    }

    #[test]
    fn test_metrics_record_without_provider() {
        // The default global provider is a no-op; recording must not panic.
        let metrics = Metrics::global();
        metrics.set_namespaces(3);
        metrics.set_pending_namespaces(1);
        metrics.set_certificates(140);
        metrics.record_refresh(Outcome::Success);
        metrics.record_apply(Outcome::Failure);
    }
}
