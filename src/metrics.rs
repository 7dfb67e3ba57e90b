use crate::resources::sandboxes::{Sandbox, SandboxSize};
use crate::Error;
use kube::ResourceExt;
use prometheus::{histogram_opts, opts, HistogramVec, IntCounterVec, Registry};
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounterVec,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "sandbox_operator_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &["size"],
        )
        .unwrap();
        let failures = IntCounterVec::new(
            opts!(
                "sandbox_operator_reconciliation_errors_total",
                "reconciliation errors",
            ),
            &["sandbox", "size", "error"],
        )
        .unwrap();
        let reconciliations = IntCounterVec::new(
            opts!(
                "sandbox_operator_reconciliations_total",
                "reconciliations by quota tier",
            ),
            &["size"],
        )
        .unwrap();
        Metrics {
            reconciliations,
            failures,
            reconcile_duration,
        }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure(&self, sandbox: &Sandbox, e: &Error) {
        self.failures
            .with_label_values(&[
                sandbox.name_any().as_str(),
                sandbox.spec.size().as_str(),
                e.metric_label(),
            ])
            .inc()
    }

    pub fn count_and_measure(&self, sandbox: &Sandbox) -> ReconcileMeasurer {
        let size = sandbox.spec.size();
        self.reconciliations
            .with_label_values(&[size.as_str()])
            .inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
            size,
        }
    }
}

/// Observes the time from its creation to its drop in the reconcile duration histogram
pub struct ReconcileMeasurer {
    start: Instant,
    metric: HistogramVec,
    size: SandboxSize,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric
            .with_label_values(&[self.size.as_str()])
            .observe(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::sandboxes::SandboxSpec;

    fn sandbox(size: &str) -> Sandbox {
        Sandbox::new(
            "test",
            SandboxSpec {
                owners: vec![],
                size: size.into(),
            },
        )
    }

    #[test]
    fn failures_are_labelled_by_sandbox_tier_and_error() {
        let registry = Registry::new();
        let metrics = Metrics::default().register(&registry).unwrap();

        metrics.reconcile_failure(&sandbox("large"), &Error::SecretNotFound("pull".into()));

        let count = metrics
            .failures
            .with_label_values(&["test", "large", "SecretNotFound"])
            .get();
        assert_eq!(count, 1);
    }

    #[test]
    fn measurer_counts_reconciliations_per_tier() {
        let metrics = Metrics::default();
        {
            let _timer = metrics.count_and_measure(&sandbox(""));
        }
        {
            let _timer = metrics.count_and_measure(&sandbox("bogus"));
        }
        assert_eq!(metrics.reconciliations.with_label_values(&["small"]).get(), 2);
        assert_eq!(metrics.reconciliations.with_label_values(&["large"]).get(), 0);
        assert_eq!(
            metrics
                .reconcile_duration
                .with_label_values(&["small"])
                .get_sample_count(),
            2
        );
    }
}
