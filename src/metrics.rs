use prometheus::{CounterVec, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector for admission decisions and state persistence
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    decisions: CounterVec,
    decision_duration: Histogram,
    buckets_active: Gauge,

    store_operations: CounterVec,
    store_operation_duration: HistogramVec,
}

impl Metrics {
    /// Create a new metrics instance with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let decisions = CounterVec::new(
            Opts::new(
                "admission_decisions_total",
                "Number of admission decisions by outcome",
            ),
            &["outcome"],
        )?;

        let decision_duration = Histogram::with_opts(HistogramOpts::new(
            "admission_decision_duration_seconds",
            "Duration of admission decisions in seconds, including bucket seeding",
        ))?;

        let buckets_active = Gauge::new(
            "admission_buckets_active",
            "Number of token buckets held in memory",
        )?;

        let store_operations = CounterVec::new(
            Opts::new(
                "admission_store_operations_total",
                "Number of persistence store operations by type and result",
            ),
            &["operation", "result"],
        )?;

        let store_operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "admission_store_operation_duration_seconds",
                "Duration of persistence store operations in seconds",
            ),
            &["operation"],
        )?;

        registry.register(Box::new(decisions.clone()))?;
        registry.register(Box::new(decision_duration.clone()))?;
        registry.register(Box::new(buckets_active.clone()))?;
        registry.register(Box::new(store_operations.clone()))?;
        registry.register(Box::new(store_operation_duration.clone()))?;

        Ok(Self {
            registry,
            decisions,
            decision_duration,
            buckets_active,
            store_operations,
            store_operation_duration,
        })
    }

    /// Get the Prometheus registry for this metrics instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_admitted(&self) {
        self.decisions.with_label_values(&["admitted"]).inc();
    }

    pub fn record_rejected(&self) {
        self.decisions.with_label_values(&["rejected"]).inc();
    }

    /// Create a timer for measuring decision duration
    pub fn start_decision_timer(&self) -> prometheus::HistogramTimer {
        self.decision_duration.start_timer()
    }

    pub fn set_buckets_active(&self, count: u64) {
        self.buckets_active.set(count as f64);
    }

    /// Record a store operation
    pub fn record_store_operation(&self, operation: &str, result: &str) {
        self.store_operations
            .with_label_values(&[operation, result])
            .inc();
    }

    /// Record store operation duration
    pub fn record_store_operation_duration(&self, operation: &str, duration_seconds: f64) {
        self.store_operation_duration
            .with_label_values(&[operation])
            .observe(duration_seconds);
    }

    pub fn admitted_count(&self) -> u64 {
        self.decisions.with_label_values(&["admitted"]).get() as u64
    }

    pub fn rejected_count(&self) -> u64 {
        self.decisions.with_label_values(&["rejected"]).get() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();

        metrics.record_admitted();
        metrics.record_admitted();
        metrics.record_rejected();
        metrics.record_store_operation("get", "success");
        metrics.record_store_operation_duration("get", 0.002);
        metrics.set_buckets_active(3);

        let _timer = metrics.start_decision_timer();

        assert_eq!(metrics.admitted_count(), 2);
        assert_eq!(metrics.rejected_count(), 1);
    }

    #[test]
    fn test_metrics_gathering() {
        let metrics = Metrics::new().unwrap();
        metrics.record_rejected();
        metrics.record_store_operation("set", "error");

        let families = metrics.registry().gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "admission_decisions_total"));
        assert!(families
            .iter()
            .any(|f| f.get_name() == "admission_store_operations_total"));
    }

    #[test]
    fn test_independent_registries() {
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();
        first.record_admitted();
        assert_eq!(first.admitted_count(), 1);
        assert_eq!(second.admitted_count(), 0);
    }
}
