//! Health reporting for the pool and transport

use crate::pool::PoolStats;

/// Health status of a connection pool
///
/// # Examples
///
/// ```
/// use connpool::{HealthStatus, PoolStats};
///
/// let stats = PoolStats { leased: 1, idle: 2, max_total: 10, max_per_route: 5, ..Default::default() };
/// let health = HealthStatus::new(&stats, true);
/// assert!(health.is_healthy());
/// assert_eq!(health.idle_connections, 2);
/// ```
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct HealthStatus {
    /// Whether the pool is healthy
    pub is_healthy: bool,

    /// Whether the transport is accepting work
    pub is_running: bool,

    /// Number of warnings detected
    pub warning_count: usize,

    /// Current pool utilization (0.0 to 1.0)
    pub utilization: f64,

    pub leased_connections: usize,

    pub idle_connections: usize,

    /// Connections currently being established
    pub pending_connections: usize,

    /// Total capacity
    pub total_capacity: usize,

    /// Warning messages
    pub warnings: Vec<String>,
}

impl HealthStatus {
    /// Create a new health status
    pub fn new(stats: &PoolStats, is_running: bool) -> Self {
        let in_use = stats.leased + stats.pending;
        let utilization = if stats.max_total > 0 {
            in_use as f64 / stats.max_total as f64
        } else {
            0.0
        };

        let mut warnings = Vec::new();
        let mut is_healthy = true;

        if !is_running {
            warnings.push("Transport is stopped".to_string());
            is_healthy = false;
        }

        // Check for high utilization
        if utilization > 0.9 {
            warnings.push(format!("High utilization: {:.1}%", utilization * 100.0));
            is_healthy = false;
        }

        if in_use >= stats.max_total && stats.max_total > 0 {
            warnings.push("Pool is exhausted".to_string());
        }

        Self {
            is_healthy,
            is_running,
            warning_count: warnings.len(),
            utilization,
            leased_connections: stats.leased,
            idle_connections: stats.idle,
            pending_connections: stats.pending,
            total_capacity: stats.max_total,
            warnings,
        }
    }

    /// Check if the pool is healthy
    pub fn is_healthy(&self) -> bool {
        self.is_healthy
    }
}
