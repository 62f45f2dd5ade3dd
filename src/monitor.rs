//! Background eviction of idle and expired connections

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::connector::{Connection, Connector};
use crate::errors::{PoolError, PoolResult, ResourceKind};
use crate::eviction::EvictionPolicy;
use crate::pool::{ConnectionPool, PoolShared};

struct MonitorTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodically sweeps a pool for idle or expired connections
///
/// The monitor holds a weak reference to the pool and exits on its own
/// once the pool is dropped or closed.
///
/// # Examples
///
/// ```no_run
/// use connpool::{ConnectionPool, HttpConnector, IdleEvictionMonitor, PoolConfig};
///
/// # async fn demo() -> connpool::PoolResult<()> {
/// let config = PoolConfig::default();
/// let pool = ConnectionPool::new(config.clone(), HttpConnector::new(&config)?)?;
/// let monitor = IdleEvictionMonitor::new(&pool);
/// assert!(monitor.try_start()?);
/// assert!(!monitor.try_start()?);
/// monitor.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct IdleEvictionMonitor<C: Connection> {
    pool: Weak<PoolShared<C>>,
    interval: Duration,
    policy: EvictionPolicy,
    task: Mutex<Option<MonitorTask>>,
    sweeps: Arc<AtomicU64>,
}

impl<C: Connection> IdleEvictionMonitor<C> {
    /// Monitor using the interval and thresholds of the pool's configuration
    pub fn new<K: Connector<Connection = C>>(pool: &ConnectionPool<K>) -> Self {
        let config = pool.config();
        Self::with_policy(
            pool,
            config.effective_monitor_interval(),
            EvictionPolicy::new(config.idle_threshold, config.effective_ttl()),
        )
    }

    pub fn with_policy<K: Connector<Connection = C>>(
        pool: &ConnectionPool<K>,
        interval: Duration,
        policy: EvictionPolicy,
    ) -> Self {
        Self {
            pool: pool.downgrade(),
            interval,
            policy,
            task: Mutex::new(None),
            sweeps: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Number of completed sweeps
    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Start the sweep loop; returns `false` if it is already running
    ///
    /// Must be called from within a tokio runtime.
    pub fn try_start(&self) -> PoolResult<bool> {
        let mut slot = self.task.lock();
        if slot.as_ref().is_some_and(|task| !task.handle.is_finished()) {
            return Ok(false);
        }
        if self.interval.is_zero() {
            return Err(PoolError::config("eviction interval must be non-zero"));
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| PoolError::config("the eviction monitor needs a running tokio runtime"))?;

        let cancel = CancellationToken::new();
        let handle = runtime.spawn(sweep_loop(
            self.pool.clone(),
            self.interval,
            self.policy,
            cancel.clone(),
            Arc::clone(&self.sweeps),
        ));
        *slot = Some(MonitorTask { cancel, handle });

        info!(interval = ?self.interval, idle_threshold = ?self.policy.idle_threshold, "eviction monitor started");
        Ok(true)
    }

    /// Stop the loop and wait for an in-flight sweep to finish
    ///
    /// No sweep runs after this returns. Stopping a stopped monitor is a no-op.
    pub async fn stop(&self) -> PoolResult<()> {
        let task = self.task.lock().take();
        let Some(task) = task else {
            return Ok(());
        };

        task.cancel.cancel();
        task.handle
            .await
            .map_err(|e| PoolError::close_message(ResourceKind::Monitor, format!("monitor task failed: {e}")))?;

        info!(sweeps = self.sweeps(), "eviction monitor stopped");
        Ok(())
    }
}

impl<C: Connection> Drop for IdleEvictionMonitor<C> {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.cancel.cancel();
        }
    }
}

async fn sweep_loop<C: Connection>(
    pool: Weak<PoolShared<C>>,
    interval: Duration,
    policy: EvictionPolicy,
    cancel: CancellationToken,
    sweeps: Arc<AtomicU64>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(pool) = pool.upgrade() else {
            debug!("pool dropped, eviction monitor exiting");
            break;
        };
        if pool.is_closed() {
            debug!("pool closed, eviction monitor exiting");
            break;
        }

        pool.evict_idle(policy).await;
        sweeps.fetch_add(1, Ordering::Relaxed);
    }
}
