use prometheus::{
    histogram_opts, opts, HistogramTimer, HistogramVec, IntCounterVec, IntGaugeVec, Registry,
};

use crate::Error;

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounterVec,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    pub running_workers: IntGaugeVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "fleet_extension_manager_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &["controller"],
        )
        .unwrap();
        let failures = IntCounterVec::new(
            opts!(
                "fleet_extension_manager_reconcile_failures_total",
                "reconciliation errors",
            ),
            &["controller", "error"],
        )
        .unwrap();
        let reconciliations = IntCounterVec::new(
            opts!(
                "fleet_extension_manager_reconciliations_total",
                "reconciliations"
            ),
            &["controller"],
        )
        .unwrap();
        let running_workers = IntGaugeVec::new(
            opts!(
                "fleet_extension_manager_running_workers",
                "workers currently processing a key"
            ),
            &["controller"],
        )
        .unwrap();
        Metrics {
            reconciliations,
            failures,
            reconcile_duration,
            running_workers,
        }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.running_workers.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure(&self, controller: &str, e: &Error) {
        self.failures
            .with_label_values(&[controller, e.metric_label().as_ref()])
            .inc()
    }

    pub fn count_and_measure(&self, controller: &str) -> HistogramTimer {
        self.reconciliations.with_label_values(&[controller]).inc();
        self.reconcile_duration
            .with_label_values(&[controller])
            .start_timer()
    }

    pub fn set_running_workers(&self, controller: &str, running: usize) {
        self.running_workers
            .with_label_values(&[controller])
            .set(running as i64);
    }

    pub fn running_workers(&self, controller: &str) -> i64 {
        self.running_workers.with_label_values(&[controller]).get()
    }
}
