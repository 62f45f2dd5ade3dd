//! Assembly of the full client runtime

use std::sync::Arc;

use tracing::{error, info};

use crate::config::PoolConfig;
use crate::connector::{Connector, HttpConnector};
use crate::errors::{PoolError, PoolResult};
use crate::health::HealthStatus;
use crate::monitor::IdleEvictionMonitor;
use crate::pool::ConnectionPool;
use crate::shutdown::{Closeable, ShutdownCoordinator, ShutdownResult};
use crate::transport::{HttpClient, TransportHandle};

/// Pool, transport, eviction monitor and shutdown coordinator, wired together
///
/// # Examples
///
/// ```no_run
/// use connpool::{ClientRuntime, PoolConfig, Route};
///
/// # async fn demo() -> connpool::PoolResult<()> {
/// let runtime = ClientRuntime::start(PoolConfig::default().with_max_total(50))?;
/// let client = runtime.client()?;
/// {
///     let exchange = client.exchange(&Route::https("example.com", 443)).await?;
///     println!("leased connection {}", exchange.id());
/// }
/// let result = runtime.shutdown().await;
/// assert!(result.is_clean());
/// # Ok(())
/// # }
/// ```
pub struct ClientRuntime<K: Connector = HttpConnector> {
    pool: ConnectionPool<K>,
    transport: Arc<TransportHandle<K>>,
    monitor: Arc<IdleEvictionMonitor<K::Connection>>,
    coordinator: Arc<ShutdownCoordinator>,
}

impl ClientRuntime<HttpConnector> {
    /// Start a runtime over plain TCP and rustls connections
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: PoolConfig) -> PoolResult<Self> {
        config.validate()?;
        let connector = HttpConnector::new(&config)?;
        Self::with_connector(config, connector)
    }
}

impl<K: Connector> ClientRuntime<K> {
    /// Start a runtime that opens connections through `connector`
    ///
    /// On failure everything built so far is released before the error is
    /// returned.
    pub fn with_connector(config: PoolConfig, connector: K) -> PoolResult<Self> {
        config.validate()?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(PoolError::config("the client runtime needs a running tokio runtime"));
        }

        let add_shutdown_hook = config.add_shutdown_hook;
        let pool = ConnectionPool::new(config, connector)?;
        let transport = Arc::new(TransportHandle::new(pool.clone())?);
        let monitor = Arc::new(IdleEvictionMonitor::new(&pool));

        if let Err(e) = monitor.try_start() {
            error!(error = %e, "eviction monitor failed to start, releasing transport");
            transport.abandon();
            return Err(e);
        }

        let coordinator = Arc::new(ShutdownCoordinator::new(
            Arc::clone(&monitor) as Arc<dyn Closeable>,
            Arc::clone(&transport) as Arc<dyn Closeable>,
            Arc::new(pool.clone()) as Arc<dyn Closeable>,
        ));

        let runtime = Self {
            pool,
            transport,
            monitor,
            coordinator,
        };

        if add_shutdown_hook {
            runtime.register_shutdown_hook()?;
        }

        let stats = runtime.pool.stats();
        info!(
            max_total = stats.max_total,
            max_per_route = stats.max_per_route,
            monitor_interval = ?runtime.monitor.interval(),
            "client runtime started"
        );
        Ok(runtime)
    }

    pub fn client(&self) -> PoolResult<HttpClient<K>> {
        self.transport.client()
    }

    pub fn transport(&self) -> &TransportHandle<K> {
        &self.transport
    }

    pub fn pool(&self) -> &ConnectionPool<K> {
        &self.pool
    }

    pub fn monitor(&self) -> &IdleEvictionMonitor<K::Connection> {
        &self.monitor
    }

    pub fn coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.coordinator
    }

    pub fn is_running(&self) -> bool {
        self.transport.is_running() && !self.coordinator.is_shut_down()
    }

    pub fn health(&self) -> HealthStatus {
        self.transport.health()
    }

    /// Tear down monitor, transport and pool
    ///
    /// Safe to call repeatedly and concurrently; the teardown runs once.
    pub async fn shutdown(&self) -> ShutdownResult {
        self.coordinator.close().await
    }

    /// Run [`shutdown`](Self::shutdown) on SIGINT or SIGTERM before exiting
    pub fn register_shutdown_hook(&self) -> PoolResult<bool> {
        self.coordinator.register_exit_hook()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::testing::ScriptedConnector;
    use crate::errors::ResourceKind;
    use crate::route::Route;
    use std::time::Duration;

    fn config() -> PoolConfig {
        PoolConfig::new()
            .with_max_total(2)
            .with_max_per_route(2)
            .with_idle_threshold(Duration::from_millis(100))
            .with_monitor_interval(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let connector = ScriptedConnector::new();
        let runtime = ClientRuntime::with_connector(config(), connector.clone()).unwrap();
        assert!(runtime.is_running());
        assert!(runtime.monitor().is_running());

        let client = runtime.client().unwrap();
        drop(client.exchange(&Route::http("a", 80)).await.unwrap());
        assert_eq!(runtime.pool().stats().idle, 1);

        let result = runtime.shutdown().await;
        assert!(result.is_clean());
        assert!(!runtime.is_running());
        assert!(!runtime.monitor().is_running());
        assert!(runtime.pool().is_closed());
        assert_eq!(connector.closed(), 1);
        assert!(matches!(runtime.client(), Err(PoolError::ClosedTransport)));
    }

    #[tokio::test]
    async fn test_shutdown_reports_failure_once() {
        let connector = ScriptedConnector::new();
        connector.fail_close_on(&[1]);
        let runtime = ClientRuntime::with_connector(config(), connector).unwrap();
        drop(runtime.pool().acquire(&Route::http("a", 80)).await.unwrap());

        let first = runtime.shutdown().await;
        let second = runtime.shutdown().await;
        assert_eq!(first.failures().len(), 1);
        assert_eq!(first.failures()[0].resource, ResourceKind::Transport);
        assert_eq!(second.failures().len(), 1);
    }

    #[test]
    fn test_start_outside_tokio_fails() {
        let result = ClientRuntime::with_connector(config(), ScriptedConnector::new());
        assert!(matches!(result, Err(PoolError::Config(_))));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_before_anything_starts() {
        let connector = ScriptedConnector::new();
        let result = ClientRuntime::with_connector(config().with_max_per_route(10), connector.clone());
        assert!(matches!(result, Err(PoolError::Config(_))));
        assert_eq!(connector.opened(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_hook_registered_from_config() {
        let runtime =
            ClientRuntime::with_connector(config().with_shutdown_hook(true), ScriptedConnector::new()).unwrap();
        assert!(runtime.coordinator().is_hook_registered());
        assert!(!runtime.register_shutdown_hook().unwrap());
        runtime.shutdown().await;
    }
}
