//! Running transport over a connection pool

use std::fmt;
use std::io;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, info, warn};

use crate::config::{PoolConfig, ProxyCredentials};
use crate::connector::{Connection, Connector, HttpConnector};
use crate::errors::{PoolError, PoolResult, ResourceKind};
use crate::health::HealthStatus;
use crate::pool::{ConnectionPool, PooledConnection};
use crate::route::Route;
use crate::tls::TlsPolicy;

/// Lifecycle state of a transport
///
/// `Created -> Running` happens once during construction and
/// `Running -> Stopped` once on close. Nothing leaves `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Created,
    Running,
    Stopped,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportState::Created => f.write_str("created"),
            TransportState::Running => f.write_str("running"),
            TransportState::Stopped => f.write_str("stopped"),
        }
    }
}

/// The live transport: pool, TLS policy, redirect and cookie settings,
/// interceptor chain
pub struct TransportHandle<K: Connector = HttpConnector> {
    pool: ConnectionPool<K>,
    state: Arc<Mutex<TransportState>>,
}

impl TransportHandle<HttpConnector> {
    /// Build the default TCP/TLS connector and pool from `config` and start
    /// the transport
    pub fn from_config(config: PoolConfig) -> PoolResult<Self> {
        config.validate()?;
        let connector = HttpConnector::new(&config)?;
        let pool = ConnectionPool::new(config, connector)?;
        Self::new(pool)
    }
}

impl<K: Connector> TransportHandle<K> {
    /// Wrap `pool` and move to `Running`
    pub fn new(pool: ConnectionPool<K>) -> PoolResult<Self> {
        if pool.is_closed() {
            return Err(PoolError::config("cannot start a transport over a closed pool"));
        }

        let handle = Self {
            pool,
            state: Arc::new(Mutex::new(TransportState::Created)),
        };

        let config = handle.pool.config();
        let policy = TlsPolicy::from_config(config);
        if policy.is_insecure() {
            warn!(tls = %policy, "transport started with insecure TLS settings");
        }
        info!(
            tls = %policy,
            follow_redirects = config.follow_redirects,
            cookie_management = config.cookie_management,
            interceptors = config.interceptors.len(),
            proxy = config.proxy.as_ref().map(|p| p.host.as_str()),
            "transport running"
        );

        *handle.state.lock() = TransportState::Running;
        Ok(handle)
    }

    pub fn state(&self) -> TransportState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == TransportState::Running
    }

    pub fn tls_policy(&self) -> TlsPolicy {
        TlsPolicy::from_config(self.pool.config())
    }

    pub fn pool(&self) -> &ConnectionPool<K> {
        &self.pool
    }

    /// Handle for issuing exchanges over the pooled connections
    pub fn client(&self) -> PoolResult<HttpClient<K>> {
        if !self.is_running() {
            return Err(PoolError::ClosedTransport);
        }
        Ok(HttpClient {
            pool: self.pool.clone(),
            state: Arc::clone(&self.state),
        })
    }

    pub fn health(&self) -> HealthStatus {
        HealthStatus::new(&self.pool.stats(), self.is_running())
    }

    /// Stop the transport and close the pool it wraps
    ///
    /// Only the first call does any work; later calls return `Ok`.
    pub async fn close(&self) -> PoolResult<()> {
        {
            let mut state = self.state.lock();
            if *state == TransportState::Stopped {
                debug!("transport already stopped");
                return Ok(());
            }
            *state = TransportState::Stopped;
        }

        let failures = self.pool.close_all().await;
        info!(failures = failures.len(), "transport stopped");
        aggregate(ResourceKind::Transport, failures)
    }

    /// Mark the transport stopped without touching the network
    pub(crate) fn abandon(&self) {
        *self.state.lock() = TransportState::Stopped;
        self.pool.close_now();
    }
}

/// Fold per-connection close failures into one error for `resource`
pub(crate) fn aggregate(resource: ResourceKind, failures: Vec<PoolError>) -> PoolResult<()> {
    if failures.is_empty() {
        return Ok(());
    }
    let details: Vec<String> = failures.iter().map(ToString::to_string).collect();
    Err(PoolError::close_message(
        resource,
        format!("{} connection(s) failed to close: {}", failures.len(), details.join("; ")),
    ))
}

/// Client-side handle of a running transport
///
/// Carries the redirect, cookie and proxy settings for the request layer and
/// leases one connection per exchange.
pub struct HttpClient<K: Connector> {
    pool: ConnectionPool<K>,
    state: Arc<Mutex<TransportState>>,
}

impl<K: Connector> Clone for HttpClient<K> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<K: Connector> HttpClient<K> {
    pub fn follow_redirects(&self) -> bool {
        self.pool.config().follow_redirects
    }

    pub fn cookie_management(&self) -> bool {
        self.pool.config().cookie_management
    }

    pub fn proxy(&self) -> Option<&ProxyCredentials> {
        self.pool.config().proxy.as_ref()
    }

    pub fn tls_policy(&self) -> TlsPolicy {
        TlsPolicy::from_config(self.pool.config())
    }

    pub fn is_running(&self) -> bool {
        *self.state.lock() == TransportState::Running
    }

    /// Run the interceptor chain and lease a connection for `route`
    pub async fn exchange(&self, route: &Route) -> PoolResult<Exchange<K::Connection>> {
        if !self.is_running() {
            return Err(PoolError::ClosedTransport);
        }

        let config = self.pool.shared_config();
        for interceptor in &config.interceptors {
            interceptor
                .before_exchange(route)
                .map_err(|reason| PoolError::Rejected {
                    interceptor: interceptor.name().to_string(),
                    reason,
                })?;
        }

        let connection = self.pool.acquire(route).await?;
        Ok(Exchange { connection, config })
    }

    /// Same as [`exchange`](Self::exchange) for a URL such as `https://host:port/path`
    pub async fn exchange_url(&self, url: &str) -> PoolResult<Exchange<K::Connection>> {
        let route: Route = url.parse()?;
        self.exchange(&route).await
    }
}

/// A connection leased for one exchange
///
/// Dropping it runs the interceptors' `after_exchange` hooks and returns the
/// connection to the pool.
pub struct Exchange<C: Connection> {
    connection: PooledConnection<C>,
    config: Arc<PoolConfig>,
}

impl<C: Connection> Exchange<C> {
    pub fn route(&self) -> &Route {
        self.connection.route()
    }
}

impl<C: Connection> fmt::Debug for Exchange<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Exchange").field(&self.connection).finish()
    }
}

impl<C: Connection> Deref for Exchange<C> {
    type Target = PooledConnection<C>;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl<C: Connection> DerefMut for Exchange<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.connection
    }
}

impl<C: Connection + AsyncRead + Unpin> AsyncRead for Exchange<C> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().connection).poll_read(cx, buf)
    }
}

impl<C: Connection + AsyncWrite + Unpin> AsyncWrite for Exchange<C> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().connection).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().connection).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().connection).poll_shutdown(cx)
    }
}

impl<C: Connection> Drop for Exchange<C> {
    fn drop(&mut self) {
        for interceptor in &self.config.interceptors {
            interceptor.after_exchange(self.connection.route());
        }
    }
}
