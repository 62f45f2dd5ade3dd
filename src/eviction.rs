//! Idle and age based eviction rules for pooled connections

use std::time::{Duration, Instant};

/// Thresholds a sweep evicts against
///
/// A connection is evicted when it has been unused for longer than
/// `idle_threshold` or has existed for longer than `ttl`.
///
/// # Examples
///
/// ```
/// use connpool::EvictionPolicy;
/// use std::time::Duration;
///
/// let policy = EvictionPolicy::new(Duration::from_secs(30), Duration::from_secs(300));
/// assert_eq!(policy.idle_threshold, Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPolicy {
    pub idle_threshold: Duration,
    pub ttl: Duration,
}

impl EvictionPolicy {
    pub fn new(idle_threshold: Duration, ttl: Duration) -> Self {
        Self { idle_threshold, ttl }
    }

    /// Only evict by age
    pub fn ttl_only(ttl: Duration) -> Self {
        Self::new(Duration::MAX, ttl)
    }

    pub(crate) fn should_evict(&self, meta: &ConnectionMetadata, now: Instant) -> bool {
        meta.idle_for(now) > self.idle_threshold || meta.age(now) > self.ttl
    }
}

/// Lifecycle timestamps of one connection
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConnectionMetadata {
    pub created_at: Instant,
    pub last_used_at: Instant,
}

impl ConnectionMetadata {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            created_at: now,
            last_used_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_used_at = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used_at)
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }
}
