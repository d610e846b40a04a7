//! Prometheus metrics for traffic decisions

use crate::error::AdmissionKind;
use anyhow::Result;
use prometheus::{Counter, CounterVec, Encoder, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Prometheus metrics collector shared by the cluster components
#[derive(Clone)]
pub struct TrafficMetrics {
    /// Calls turned away by a throttle, by kind
    pub admission_rejections_total: CounterVec,
    /// Calls that found no provider after routing
    pub no_provider_total: Counter,
    /// Connections opened by the pool
    pub pool_connections_created_total: Counter,
    /// Idle connections shut down by eviction
    pub pool_connections_evicted_total: Counter,
    /// Connections currently parked idle
    pub pool_idle_connections: IntGauge,
    /// Category lists received from the registry
    pub registry_notifications_total: CounterVec,
    /// Prometheus registry for metrics
    pub registry: Arc<Registry>,
}

impl TrafficMetrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let admission_rejections_total = CounterVec::new(
            Opts::new("admission_rejections_total", "Calls rejected by admission control"),
            &["kind"],
        )?;

        let no_provider_total = Counter::new(
            "no_provider_total",
            "Calls with no available provider",
        )?;

        let pool_connections_created_total = Counter::new(
            "pool_connections_created_total",
            "Connections created by the pool",
        )?;

        let pool_connections_evicted_total = Counter::new(
            "pool_connections_evicted_total",
            "Idle connections evicted by the pool",
        )?;

        let pool_idle_connections = IntGauge::new(
            "pool_idle_connections",
            "Connections currently idle in the pool",
        )?;

        let registry_notifications_total = CounterVec::new(
            Opts::new("registry_notifications_total", "Registry notifications by category"),
            &["category"],
        )?;

        registry.register(Box::new(admission_rejections_total.clone()))?;
        registry.register(Box::new(no_provider_total.clone()))?;
        registry.register(Box::new(pool_connections_created_total.clone()))?;
        registry.register(Box::new(pool_connections_evicted_total.clone()))?;
        registry.register(Box::new(pool_idle_connections.clone()))?;
        registry.register(Box::new(registry_notifications_total.clone()))?;

        Ok(Self {
            admission_rejections_total,
            no_provider_total,
            pool_connections_created_total,
            pool_connections_evicted_total,
            pool_idle_connections,
            registry_notifications_total,
            registry,
        })
    }

    pub fn record_rejection(&self, kind: AdmissionKind) {
        self.admission_rejections_total
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    pub fn rejections(&self, kind: AdmissionKind) -> u64 {
        self.admission_rejections_total
            .with_label_values(&[kind.as_str()])
            .get() as u64
    }

    pub fn record_notification(&self, category: &str) {
        self.registry_notifications_total
            .with_label_values(&[category])
            .inc();
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = TrafficMetrics::new().expect("Failed to create metrics");
        assert!(metrics.gather().is_ok());
    }

    #[test]
    fn test_clones_share_registry() {
        let first = TrafficMetrics::new().expect("Failed to create metrics");
        let second = first.clone();
        second.record_rejection(AdmissionKind::Rate);
        second.record_rejection(AdmissionKind::Rate);
        assert_eq!(first.rejections(AdmissionKind::Rate), 2);
        assert_eq!(first.rejections(AdmissionKind::Concurrency), 0);
    }

    #[test]
    fn test_text_format_structure() {
        let metrics = TrafficMetrics::new().expect("Failed to create metrics");
        metrics.record_rejection(AdmissionKind::Concurrency);
        metrics.record_notification("providers");
        metrics.no_provider_total.inc();

        let text = metrics.gather().expect("Failed to gather metrics");
        assert!(text.contains("# HELP"));
        assert!(text.contains("# TYPE"));
        assert!(text.contains("admission_rejections_total{kind=\"concurrency\"} 1"));
        assert!(text.contains("registry_notifications_total{category=\"providers\"} 1"));
        assert!(text.contains("no_provider_total 1"));
    }
}
