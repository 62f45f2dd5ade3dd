//! Ordered, failure-tolerant teardown

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::connector::{Connection, Connector};
use crate::errors::{PoolError, PoolResult, ResourceKind};
use crate::monitor::IdleEvictionMonitor;
use crate::pool::ConnectionPool;
use crate::transport::{TransportHandle, aggregate};

/// A resource the coordinator can tear down
#[async_trait]
pub trait Closeable: Send + Sync {
    fn kind(&self) -> ResourceKind;

    /// Release the resource; calling it again after success is a no-op
    async fn close(&self) -> PoolResult<()>;

    fn is_closed(&self) -> bool;
}

#[async_trait]
impl<C: Connection> Closeable for IdleEvictionMonitor<C> {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Monitor
    }

    async fn close(&self) -> PoolResult<()> {
        self.stop().await
    }

    fn is_closed(&self) -> bool {
        !self.is_running()
    }
}

#[async_trait]
impl<K: Connector> Closeable for TransportHandle<K> {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Transport
    }

    async fn close(&self) -> PoolResult<()> {
        TransportHandle::close(self).await
    }

    fn is_closed(&self) -> bool {
        !self.is_running()
    }
}

#[async_trait]
impl<K: Connector> Closeable for ConnectionPool<K> {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Pool
    }

    async fn close(&self) -> PoolResult<()> {
        aggregate(ResourceKind::Pool, self.close_all().await)
    }

    fn is_closed(&self) -> bool {
        ConnectionPool::is_closed(self)
    }
}

/// One resource that failed to release during shutdown
#[derive(Debug, Clone)]
pub struct ShutdownFailure {
    pub resource: ResourceKind,
    pub error: PoolError,
}

/// Outcome of a shutdown: every step that failed, in teardown order
#[derive(Debug, Clone, Default)]
pub struct ShutdownResult {
    failures: Vec<ShutdownFailure>,
}

impl ShutdownResult {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failures(&self) -> &[ShutdownFailure] {
        &self.failures
    }

    pub fn into_failures(self) -> Vec<ShutdownFailure> {
        self.failures
    }

    fn record(&mut self, resource: ResourceKind, error: PoolError) {
        warn!(%resource, %error, "shutdown step failed");
        self.failures.push(ShutdownFailure { resource, error });
    }
}

impl fmt::Display for ShutdownResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clean() {
            return f.write_str("clean shutdown");
        }
        write!(f, "{} shutdown failure(s)", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "; {}: {}", failure.resource, failure.error)?;
        }
        Ok(())
    }
}

type Outcome = watch::Receiver<Option<ShutdownResult>>;

/// Tears down monitor, transport and pool, in that order
///
/// Every step runs even when an earlier one fails. The teardown happens at
/// most once on a task of its own, so dropping a pending
/// [`close`](Self::close) does not interrupt it; every call, later ones
/// included, returns the same result.
pub struct ShutdownCoordinator {
    monitor: Arc<dyn Closeable>,
    transport: Arc<dyn Closeable>,
    pool: Arc<dyn Closeable>,
    outcome: Mutex<Option<Outcome>>,
    hook_registered: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new(monitor: Arc<dyn Closeable>, transport: Arc<dyn Closeable>, pool: Arc<dyn Closeable>) -> Self {
        Self {
            monitor,
            transport,
            pool,
            outcome: Mutex::new(None),
            hook_registered: AtomicBool::new(false),
        }
    }

    /// Run the teardown, or wait for the one already started
    ///
    /// Must be called from within a tokio runtime.
    pub async fn close(&self) -> ShutdownResult {
        let mut outcome = match self.start() {
            Ok(outcome) => outcome,
            Err(e) => {
                let mut result = ShutdownResult::default();
                result.record(ResourceKind::Pool, e);
                return result;
            }
        };

        match outcome.wait_for(Option::is_some).await {
            Ok(result) => result.clone().unwrap_or_default(),
            Err(_) => {
                let mut result = ShutdownResult::default();
                result.record(
                    ResourceKind::Pool,
                    PoolError::close_message(ResourceKind::Pool, "shutdown task aborted before finishing"),
                );
                result
            }
        }
    }

    /// Whether the teardown has finished
    pub fn is_shut_down(&self) -> bool {
        self.outcome
            .lock()
            .as_ref()
            .is_some_and(|outcome| outcome.borrow().is_some())
    }

    /// Spawn the teardown on first use; later callers subscribe to it
    fn start(&self) -> PoolResult<Outcome> {
        let mut slot = self.outcome.lock();
        if let Some(outcome) = slot.as_ref() {
            return Ok(outcome.clone());
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| PoolError::config("shutdown needs a running tokio runtime"))?;

        let (done, outcome) = watch::channel(None);
        let steps = teardown(
            Arc::clone(&self.monitor),
            Arc::clone(&self.transport),
            Arc::clone(&self.pool),
        );
        runtime.spawn(async move {
            let result = steps.await;
            done.send_replace(Some(result));
        });

        *slot = Some(outcome.clone());
        Ok(outcome)
    }

    /// Tear down on SIGINT or SIGTERM, then exit the process
    ///
    /// Only the first registration installs a hook; later calls return
    /// `Ok(false)`. Must be called from within a tokio runtime.
    pub fn register_exit_hook(self: &Arc<Self>) -> PoolResult<bool> {
        if self.hook_registered.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                self.hook_registered.store(false, Ordering::SeqCst);
                return Err(PoolError::config("the exit hook needs a running tokio runtime"));
            }
        };

        let coordinator = Arc::downgrade(self);
        runtime.spawn(async move {
            let Some(code) = exit_signal().await else {
                return;
            };
            if let Some(coordinator) = coordinator.upgrade() {
                let result = coordinator.close().await;
                info!(%result, "exit hook finished teardown");
            }
            std::process::exit(code);
        });

        debug!("exit hook registered");
        Ok(true)
    }

    pub fn is_hook_registered(&self) -> bool {
        self.hook_registered.load(Ordering::SeqCst)
    }
}

async fn teardown(
    monitor: Arc<dyn Closeable>,
    transport: Arc<dyn Closeable>,
    pool: Arc<dyn Closeable>,
) -> ShutdownResult {
    info!("shutting down connection pool runtime");
    let mut result = ShutdownResult::default();

    // No sweep may race with pool teardown
    if let Err(e) = monitor.close().await {
        result.record(monitor.kind(), e);
    }

    if let Err(e) = transport.close().await {
        result.record(transport.kind(), e);
    }

    if pool.is_closed() {
        debug!("pool already closed by the transport");
    } else if let Err(e) = pool.close().await {
        result.record(pool.kind(), e);
    }

    if result.is_clean() {
        info!("shutdown complete");
    } else {
        error!(%result, "shutdown completed with failures");
    }
    result
}

/// Wait for a termination signal; yields the conventional exit status
async fn exit_signal() -> Option<i32> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                return tokio::signal::ctrl_c().await.ok().map(|_| 130);
            }
        };
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.ok().map(|_| 130),
            _ = terminate.recv() => Some(143),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok().map(|_| 130)
    }
}
