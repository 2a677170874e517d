//! Prometheus metrics for cache domains and invalidation.
//!
//! Each [`CacheMetrics`] owns its own registry so independent instances
//! (one per process, one per test) never collide on metric names.

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

/// Container for all cache metrics.
#[derive(Clone)]
pub struct CacheMetrics {
    registry: Registry,

    /// Lookups - labels: domain, result (hit/miss)
    pub lookups_total: IntCounterVec,

    /// Remote fetches - labels: domain, outcome (ok/error/timeout/aborted/joined)
    pub fetches_total: IntCounterVec,

    /// Capacity evictions - labels: domain
    pub evictions_total: IntCounterVec,

    /// Invalidation broadcasts - labels: domain
    pub invalidations_total: IntCounterVec,

    /// Failed invalidation callbacks - labels: domain
    pub callback_failures_total: IntCounterVec,
}

impl CacheMetrics {
    /// Create and register all metrics.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let lookups_total = IntCounterVec::new(
            Opts::new("wewrite_cache_lookups_total", "Cache lookups by result"),
            &["domain", "result"],
        )?;
        let fetches_total = IntCounterVec::new(
            Opts::new("wewrite_cache_fetches_total", "Remote fetches by outcome"),
            &["domain", "outcome"],
        )?;
        let evictions_total = IntCounterVec::new(
            Opts::new("wewrite_cache_evictions_total", "Entries evicted to make room"),
            &["domain"],
        )?;
        let invalidations_total = IntCounterVec::new(
            Opts::new("wewrite_invalidations_total", "Invalidation broadcasts"),
            &["domain"],
        )?;
        let callback_failures_total = IntCounterVec::new(
            Opts::new(
                "wewrite_invalidation_callback_failures_total",
                "Invalidation callbacks that failed",
            ),
            &["domain"],
        )?;

        registry.register(Box::new(lookups_total.clone()))?;
        registry.register(Box::new(fetches_total.clone()))?;
        registry.register(Box::new(evictions_total.clone()))?;
        registry.register(Box::new(invalidations_total.clone()))?;
        registry.register(Box::new(callback_failures_total.clone()))?;

        Ok(Self {
            registry,
            lookups_total,
            fetches_total,
            evictions_total,
            invalidations_total,
            callback_failures_total,
        })
    }

    pub fn record_lookup(&self, domain: &str, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.lookups_total.with_label_values(&[domain, result]).inc();
    }

    pub fn record_fetch(&self, domain: &str, outcome: &str) {
        self.fetches_total.with_label_values(&[domain, outcome]).inc();
    }

    pub fn record_eviction(&self, domain: &str) {
        self.evictions_total.with_label_values(&[domain]).inc();
    }

    pub fn record_invalidation(&self, domain: &str, failed: usize) {
        self.invalidations_total.with_label_values(&[domain]).inc();
        if failed > 0 {
            self.callback_failures_total
                .with_label_values(&[domain])
                .inc_by(failed as u64);
        }
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_independent_registries() {
        let a = CacheMetrics::new().unwrap();
        let b = CacheMetrics::new().unwrap();
        a.record_lookup("users", true);

        assert_eq!(a.lookups_total.with_label_values(&["users", "hit"]).get(), 1);
        assert_eq!(b.lookups_total.with_label_values(&["users", "hit"]).get(), 0);
    }

    #[test]
    fn test_render_contains_counters() {
        let metrics = CacheMetrics::new().unwrap();
        metrics.record_fetch("pages", "ok");
        metrics.record_invalidation("userPages", 2);

        let text = metrics.render().unwrap();
        assert!(text.contains("wewrite_cache_fetches_total"));
        assert!(text.contains("wewrite_invalidation_callback_failures_total{domain=\"userPages\"} 2"));
    }
}
