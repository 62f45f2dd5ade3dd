//! Metrics collection and export for the connection pool

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::pool::PoolStats;

/// Metrics data for a pool
///
/// # Examples
///
/// ```no_run
/// use connpool::{ClientRuntime, PoolConfig};
///
/// # async fn demo() -> connpool::PoolResult<()> {
/// let runtime = ClientRuntime::start(PoolConfig::default())?;
/// let metrics = runtime.pool().get_metrics();
/// assert_eq!(metrics.leased_connections, 0);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PoolMetrics {
    /// Connections opened
    pub total_created: u64,

    /// Leases served from an idle connection
    pub total_reused: u64,

    /// Leases handed out
    pub total_leased: u64,

    /// Leases returned to the idle set
    pub total_returned: u64,

    /// Leases dropped without being pooled (broken, discarded or detached)
    pub total_discarded: u64,

    /// Idle connections removed for idleness or age
    pub total_evicted: u64,

    /// Acquires refused because a cap was reached
    pub exhausted_events: u64,

    pub connect_failures: u64,

    pub close_failures: u64,

    /// Current leased connections
    pub leased_connections: usize,

    /// Current idle connections
    pub idle_connections: usize,

    /// Pool utilization ratio (0.0 to 1.0)
    pub utilization: f64,

    /// Maximum number of connections
    pub max_total: usize,
}

impl PoolMetrics {
    /// Export metrics as a HashMap
    pub fn export(&self) -> HashMap<String, String> {
        let mut metrics = HashMap::new();
        metrics.insert("total_created".to_string(), self.total_created.to_string());
        metrics.insert("total_reused".to_string(), self.total_reused.to_string());
        metrics.insert("total_leased".to_string(), self.total_leased.to_string());
        metrics.insert("total_returned".to_string(), self.total_returned.to_string());
        metrics.insert("total_discarded".to_string(), self.total_discarded.to_string());
        metrics.insert("total_evicted".to_string(), self.total_evicted.to_string());
        metrics.insert("exhausted_events".to_string(), self.exhausted_events.to_string());
        metrics.insert("connect_failures".to_string(), self.connect_failures.to_string());
        metrics.insert("close_failures".to_string(), self.close_failures.to_string());
        metrics.insert("leased_connections".to_string(), self.leased_connections.to_string());
        metrics.insert("idle_connections".to_string(), self.idle_connections.to_string());
        metrics.insert("utilization".to_string(), format!("{:.2}", self.utilization));
        metrics.insert("max_total".to_string(), self.max_total.to_string());
        metrics
    }
}

/// Metrics exporter for Prometheus format
#[cfg(feature = "metrics")]
pub struct MetricsExporter;

#[cfg(feature = "metrics")]
impl MetricsExporter {
    /// Export metrics in Prometheus text exposition format
    ///
    /// # Examples
    ///
    /// ```
    /// use connpool::{MetricsExporter, PoolMetrics};
    /// use std::collections::HashMap;
    ///
    /// let mut tags = HashMap::new();
    /// tags.insert("service".to_string(), "api".to_string());
    ///
    /// let output = MetricsExporter::export_prometheus(&PoolMetrics::default(), "upstream", Some(&tags)).unwrap();
    /// assert!(output.contains("connpool_connections_leased"));
    /// assert!(output.contains("service=\"api\""));
    /// ```
    pub fn export_prometheus(
        metrics: &PoolMetrics,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> Result<String, prometheus::Error> {
        use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Opts, Registry, TextEncoder};

        let mut labels = HashMap::new();
        labels.insert("pool".to_string(), pool_name.to_string());
        if let Some(tags) = tags {
            labels.extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        let registry = Registry::new_custom(Some("connpool".to_string()), Some(labels))?;

        let gauges = [
            ("connections_leased", "Current leased connections", metrics.leased_connections),
            ("connections_idle", "Current idle connections", metrics.idle_connections),
            ("connections_max", "Maximum number of connections", metrics.max_total),
        ];
        for (name, help, value) in gauges {
            let gauge = IntGauge::with_opts(Opts::new(name, help))?;
            gauge.set(value as i64);
            registry.register(Box::new(gauge))?;
        }

        let utilization = Gauge::with_opts(Opts::new("utilization", "Pool utilization ratio"))?;
        utilization.set(metrics.utilization);
        registry.register(Box::new(utilization))?;

        let counters = [
            ("connections_created_total", "Connections opened", metrics.total_created),
            ("connections_reused_total", "Leases served from idle connections", metrics.total_reused),
            ("connections_leased_total", "Leases handed out", metrics.total_leased),
            ("connections_returned_total", "Leases returned to the pool", metrics.total_returned),
            ("connections_discarded_total", "Leases dropped without pooling", metrics.total_discarded),
            ("connections_evicted_total", "Idle connections evicted", metrics.total_evicted),
            ("exhausted_total", "Acquires refused at capacity", metrics.exhausted_events),
            ("connect_failures_total", "Failed connection attempts", metrics.connect_failures),
            ("close_failures_total", "Connections that failed to close", metrics.close_failures),
        ];
        for (name, help, value) in counters {
            let counter = IntCounter::with_opts(Opts::new(name, help))?;
            counter.inc_by(value);
            registry.register(Box::new(counter))?;
        }

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// Internal metrics tracker
#[derive(Default)]
pub(crate) struct MetricsTracker {
    pub total_created: AtomicU64,
    pub total_reused: AtomicU64,
    pub total_leased: AtomicU64,
    pub total_returned: AtomicU64,
    pub total_discarded: AtomicU64,
    pub total_evicted: AtomicU64,
    pub exhausted_events: AtomicU64,
    pub connect_failures: AtomicU64,
    pub close_failures: AtomicU64,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_metrics(&self, stats: &PoolStats) -> PoolMetrics {
        let utilization = if stats.max_total > 0 {
            stats.leased as f64 / stats.max_total as f64
        } else {
            0.0
        };

        PoolMetrics {
            total_created: self.total_created.load(Ordering::Relaxed),
            total_reused: self.total_reused.load(Ordering::Relaxed),
            total_leased: self.total_leased.load(Ordering::Relaxed),
            total_returned: self.total_returned.load(Ordering::Relaxed),
            total_discarded: self.total_discarded.load(Ordering::Relaxed),
            total_evicted: self.total_evicted.load(Ordering::Relaxed),
            exhausted_events: self.exhausted_events.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            close_failures: self.close_failures.load(Ordering::Relaxed),
            leased_connections: stats.leased,
            idle_connections: stats.idle,
            utilization,
            max_total: stats.max_total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utilization_from_stats() {
        let tracker = MetricsTracker::new();
        tracker.total_created.fetch_add(3, Ordering::Relaxed);
        let stats = PoolStats {
            leased: 1,
            idle: 2,
            max_total: 4,
            ..PoolStats::default()
        };

        let metrics = tracker.get_metrics(&stats);
        assert_eq!(metrics.total_created, 3);
        assert!((metrics.utilization - 0.25).abs() < f64::EPSILON);
        assert_eq!(metrics.export().get("utilization").map(String::as_str), Some("0.25"));
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_prometheus_export_contains_counters() {
        let metrics = PoolMetrics {
            total_evicted: 7,
            max_total: 10,
            ..PoolMetrics::default()
        };
        let output = MetricsExporter::export_prometheus(&metrics, "edge", None).unwrap();
        assert!(output.contains("connpool_connections_evicted_total{pool=\"edge\"} 7"));
        assert!(output.contains("# TYPE connpool_connections_max gauge"));
    }
}
