use prometheus::{Counter, CounterVec, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector for the rate limiting and caching layer
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Limiter metrics
    decisions: CounterVec,
    compensations: CounterVec,

    // Store metrics
    store_errors: CounterVec,
    store_operation_duration: HistogramVec,
    store_fallbacks: Counter,

    // Cache metrics
    cache_lookups: CounterVec,
}

impl Metrics {
    /// Create a new metrics instance with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let decisions = CounterVec::new(
            Opts::new(
                "ratelimit_decisions_total",
                "Rate limit decisions by policy and outcome",
            ),
            &["policy", "outcome"],
        )?;

        let compensations = CounterVec::new(
            Opts::new(
                "ratelimit_compensations_total",
                "Compensating decrements issued by skip rules",
            ),
            &["policy", "result"],
        )?;

        let store_errors = CounterVec::new(
            Opts::new(
                "ratelimit_store_errors_total",
                "Counter store operations that failed and were answered fail-open",
            ),
            &["backend", "operation"],
        )?;

        let store_operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "ratelimit_store_operation_duration_seconds",
                "Duration of counter store operations in seconds",
            ),
            &["backend", "operation"],
        )?;

        let store_fallbacks = Counter::new(
            "ratelimit_store_fallbacks_total",
            "Counter stores created on the local fallback because Redis was unavailable",
        )?;

        let cache_lookups = CounterVec::new(
            Opts::new("cache_lookups_total", "Cache lookups by result"),
            &["result"],
        )?;

        registry.register(Box::new(decisions.clone()))?;
        registry.register(Box::new(compensations.clone()))?;
        registry.register(Box::new(store_errors.clone()))?;
        registry.register(Box::new(store_operation_duration.clone()))?;
        registry.register(Box::new(store_fallbacks.clone()))?;
        registry.register(Box::new(cache_lookups.clone()))?;

        Ok(Self {
            registry,
            decisions,
            compensations,
            store_errors,
            store_operation_duration,
            store_fallbacks,
            cache_lookups,
        })
    }

    /// Get the Prometheus registry for this metrics instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a limiter decision (`allowed`, `denied` or `skipped`)
    pub fn record_decision(&self, policy: &str, outcome: &str) {
        self.decisions.with_label_values(&[policy, outcome]).inc();
    }

    /// Record a compensating decrement (`ok` or `error`)
    pub fn record_compensation(&self, policy: &str, result: &str) {
        self.compensations.with_label_values(&[policy, result]).inc();
    }

    pub fn record_store_error(&self, backend: &str, operation: &str) {
        self.store_errors
            .with_label_values(&[backend, operation])
            .inc();
    }

    pub fn record_store_operation_duration(
        &self,
        backend: &str,
        operation: &str,
        duration_seconds: f64,
    ) {
        self.store_operation_duration
            .with_label_values(&[backend, operation])
            .observe(duration_seconds);
    }

    pub fn record_store_fallback(&self) {
        self.store_fallbacks.inc();
    }

    /// Record a cache lookup (`hit`, `miss` or `error`)
    pub fn record_cache_lookup(&self, result: &str) {
        self.cache_lookups.with_label_values(&[result]).inc();
    }

    #[cfg(test)]
    pub(crate) fn decision_count(&self, policy: &str, outcome: &str) -> f64 {
        self.decisions.with_label_values(&[policy, outcome]).get()
    }

    #[cfg(test)]
    pub(crate) fn store_error_count(&self, backend: &str, operation: &str) -> f64 {
        self.store_errors.with_label_values(&[backend, operation]).get()
    }

    #[cfg(test)]
    pub(crate) fn cache_lookup_count(&self, result: &str) -> f64 {
        self.cache_lookups.with_label_values(&[result]).get()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();

        metrics.record_decision("auth", "denied");
        metrics.record_compensation("auth", "ok");
        metrics.record_store_error("redis", "increment");
        metrics.record_store_operation_duration("redis", "increment", 0.002);
        metrics.record_store_fallback();
        metrics.record_cache_lookup("miss");

        assert_eq!(metrics.decision_count("auth", "denied"), 1.0);
        assert_eq!(metrics.cache_lookup_count("miss"), 1.0);
    }

    #[test]
    fn test_metrics_gathering() {
        let metrics = Metrics::new().unwrap();
        metrics.record_decision("search", "allowed");

        let families = metrics.registry().gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "ratelimit_decisions_total"));
    }

    #[test]
    fn test_instances_do_not_share_state() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.record_decision("api", "allowed");
        assert_eq!(b.decision_count("api", "allowed"), 0.0);
    }
}
