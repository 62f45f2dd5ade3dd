//! Route-keyed connection pool

use crate::config::{ExhaustionPolicy, MAX_WAIT, PoolConfig};
use crate::connector::{Connection, Connector};
use crate::errors::{PoolError, PoolResult, ResourceKind};
use crate::eviction::{ConnectionMetadata, EvictionPolicy};
use crate::health::HealthStatus;
use crate::metrics::{MetricsTracker, PoolMetrics};
use crate::route::Route;

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::io;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Notify;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture, WaitForCancellationFutureOwned};
use tracing::{debug, info, trace, warn};

/// A connection leased from the pool
///
/// Dropping the lease returns the connection to the pool, the same as
/// [`ConnectionPool::release`].
///
/// Closing the pool revokes every lease. Reads and writes through a revoked
/// lease fail with [`io::ErrorKind::ConnectionAborted`], pending ones
/// included, and the connection is closed as soon as the lease is dropped.
pub struct PooledConnection<C: Connection> {
    connection: Option<C>,
    id: u64,
    route: Route,
    meta: ConnectionMetadata,
    pool: Weak<PoolShared<C>>,
    revoked: CancellationToken,
    revocation: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
}

impl<C: Connection> PooledConnection<C> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn created_at(&self) -> Instant {
        self.meta.created_at
    }

    pub fn last_used_at(&self) -> Instant {
        self.meta.last_used_at
    }

    /// Whether the pool has been closed since this lease was handed out
    pub fn is_revoked(&self) -> bool {
        self.revoked.is_cancelled()
    }

    /// Completes once the pool revokes this lease
    pub fn revoked(&self) -> WaitForCancellationFuture<'_> {
        self.revoked.cancelled()
    }

    fn poll_revoked(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if self.revoked.is_cancelled() {
            return Poll::Ready(());
        }
        self.revocation
            .get_or_insert_with(|| Box::pin(self.revoked.clone().cancelled_owned()))
            .as_mut()
            .poll(cx)
    }

    fn inner_pin(&mut self) -> io::Result<Pin<&mut C>>
    where
        C: Unpin,
    {
        self.connection
            .as_mut()
            .map(Pin::new)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection already taken"))
    }

    /// Take the connection out of the pool for good, freeing its slot
    pub fn detach(mut self) -> C {
        if let Some(shared) = self.pool.upgrade() {
            shared.forget(self.id, &self.route);
        }
        self.connection.take().expect("Connection already taken")
    }
}

impl<C: Connection> fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("route", &self.route)
            .field("created_at", &self.meta.created_at)
            .finish_non_exhaustive()
    }
}

impl<C: Connection> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        self.connection.as_ref().expect("Connection already taken")
    }
}

impl<C: Connection> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection.as_mut().expect("Connection already taken")
    }
}

fn revoked_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "lease revoked by pool shutdown")
}

impl<C: Connection + AsyncRead + Unpin> AsyncRead for PooledConnection<C> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_revoked(cx).is_ready() {
            return Poll::Ready(Err(revoked_error()));
        }
        match this.inner_pin() {
            Ok(inner) => inner.poll_read(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl<C: Connection + AsyncWrite + Unpin> AsyncWrite for PooledConnection<C> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.poll_revoked(cx).is_ready() {
            return Poll::Ready(Err(revoked_error()));
        }
        match this.inner_pin() {
            Ok(inner) => inner.poll_write(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_revoked(cx).is_ready() {
            return Poll::Ready(Err(revoked_error()));
        }
        match this.inner_pin() {
            Ok(inner) => inner.poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().inner_pin() {
            Ok(inner) => inner.poll_shutdown(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl<C: Connection> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        match self.pool.upgrade() {
            Some(shared) => shared.check_in(self.id, &self.route, connection, self.meta),
            None => trace!(route = %self.route, id = self.id, "pool gone, dropping connection"),
        }
    }
}

struct IdleEntry<C> {
    id: u64,
    connection: C,
    meta: ConnectionMetadata,
}

/// Per-route slot accounting
struct RouteSlots<C> {
    /// Most recently used last
    idle: Vec<IdleEntry<C>>,
    leased: HashSet<u64>,
    pending: usize,
}

impl<C> Default for RouteSlots<C> {
    fn default() -> Self {
        Self {
            idle: Vec::new(),
            leased: HashSet::new(),
            pending: 0,
        }
    }
}

impl<C> RouteSlots<C> {
    fn count(&self) -> usize {
        self.idle.len() + self.leased.len() + self.pending
    }

    fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

struct PoolState<C> {
    routes: HashMap<Route, RouteSlots<C>>,
    /// Idle, leased and pending connections across all routes
    total: usize,
    closed: bool,
    /// Leases outstanding when the pool closed that `close_all` still waits for
    revoked: HashSet<u64>,
    /// Revoked connections handed back, waiting to be closed by `close_all`
    returned: Vec<IdleEntry<C>>,
}

enum Checkout<C> {
    Reused(IdleEntry<C>),
    Reserved,
    Exhausted,
}

/// State shared between the pool handle, its leases and the eviction monitor
pub(crate) struct PoolShared<C> {
    config: Arc<PoolConfig>,
    state: Mutex<PoolState<C>>,
    released: Notify,
    /// Cancelled when the pool closes; every lease holds a clone
    shutdown: CancellationToken,
    metrics: MetricsTracker,
    next_id: AtomicU64,
}

impl<C: Connection> PoolShared<C> {
    fn checkout(&self, route: &Route) -> PoolResult<(Checkout<C>, Vec<IdleEntry<C>>)> {
        let policy = self.eviction_policy();
        let max_total = self.config.max_total;
        let max_per_route = self.config.max_per_route;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(PoolError::ClosedTransport);
        }

        let now = Instant::now();
        let mut stale = Vec::new();
        let slots = state.routes.entry(route.clone()).or_default();

        while let Some(entry) = slots.idle.pop() {
            if policy.should_evict(&entry.meta, now) {
                stale.push(entry);
                continue;
            }
            slots.leased.insert(entry.id);
            state.total -= stale.len();
            return Ok((Checkout::Reused(entry), stale));
        }
        state.total -= stale.len();

        if slots.count() >= max_per_route {
            return Ok((Checkout::Exhausted, stale));
        }

        if state.total >= max_total {
            // Make room by closing the least recently used idle connection of another route
            match Self::take_lru_idle(&mut state.routes, route) {
                Some(victim) => {
                    state.total -= 1;
                    stale.push(victim);
                }
                None => {
                    Self::prune(&mut state.routes, route);
                    return Ok((Checkout::Exhausted, stale));
                }
            }
        }

        if let Some(slots) = state.routes.get_mut(route) {
            slots.pending += 1;
            state.total += 1;
        }
        Ok((Checkout::Reserved, stale))
    }

    fn take_lru_idle(routes: &mut HashMap<Route, RouteSlots<C>>, except: &Route) -> Option<IdleEntry<C>> {
        let (victim_route, index) = routes
            .iter()
            .filter(|(route, _)| *route != except)
            .flat_map(|(route, slots)| {
                slots
                    .idle
                    .iter()
                    .enumerate()
                    .map(move |(index, entry)| (route, index, entry.meta.last_used_at))
            })
            .min_by_key(|(_, _, last_used)| *last_used)
            .map(|(route, index, _)| (route.clone(), index))?;

        let slots = routes.get_mut(&victim_route)?;
        let entry = slots.idle.remove(index);
        if slots.is_empty() {
            routes.remove(&victim_route);
        }
        Some(entry)
    }

    fn prune(routes: &mut HashMap<Route, RouteSlots<C>>, route: &Route) {
        if routes.get(route).is_some_and(RouteSlots::is_empty) {
            routes.remove(route);
        }
    }

    /// Turn a pending reservation into a lease; `false` if the pool closed meanwhile
    fn complete_reservation(&self, route: &Route, id: u64) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        match state.routes.get_mut(route) {
            Some(slots) => {
                slots.pending = slots.pending.saturating_sub(1);
                slots.leased.insert(id);
                true
            }
            None => false,
        }
    }

    fn cancel_reservation(&self, route: &Route) {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.closed {
                return;
            }
            if let Some(slots) = state.routes.get_mut(route) {
                slots.pending = slots.pending.saturating_sub(1);
                state.total = state.total.saturating_sub(1);
            }
            Self::prune(&mut state.routes, route);
        }
        self.released.notify_waiters();
    }

    /// Return a leased connection to the idle set
    fn check_in(self: &Arc<Self>, id: u64, route: &Route, connection: C, mut meta: ConnectionMetadata) {
        if !connection.is_open() {
            debug!(%route, id, "discarding connection that is no longer open");
            self.forget(id, route);
            return;
        }

        {
            let mut state = self.state.lock();
            if state.closed {
                if state.revoked.remove(&id) {
                    trace!(%route, id, "revoked connection returned, handing it to close_all");
                    state.returned.push(IdleEntry { id, connection, meta });
                    drop(state);
                    self.released.notify_waiters();
                } else {
                    drop(state);
                    self.close_in_background(id, connection);
                }
                return;
            }
            let Some(slots) = state.routes.get_mut(route) else {
                trace!(%route, id, "release of unknown lease ignored");
                return;
            };
            if !slots.leased.remove(&id) {
                trace!(%route, id, "release of unknown lease ignored");
                return;
            }
            meta.touch();
            slots.idle.push(IdleEntry { id, connection, meta });
        }

        self.metrics.total_returned.fetch_add(1, Ordering::Relaxed);
        self.released.notify_waiters();
    }

    /// Close a connection returned after the pool finished closing
    fn close_in_background(self: &Arc<Self>, id: u64, mut connection: C) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(id, "no runtime to close a late connection, dropping it");
            return;
        };
        let shared = Arc::clone(self);
        runtime.spawn(async move {
            match connection.close().await {
                Ok(()) => debug!(id, "closed connection returned after pool shutdown"),
                Err(e) => {
                    shared.metrics.close_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(id, error = %e, "failed to close connection returned after pool shutdown");
                }
            }
        });
    }

    /// Drop a lease without pooling its connection
    fn forget(&self, id: u64, route: &Route) {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.revoked.remove(&id) {
                drop(guard);
                self.metrics.total_discarded.fetch_add(1, Ordering::Relaxed);
                self.released.notify_waiters();
                return;
            }
            let removed = state
                .routes
                .get_mut(route)
                .is_some_and(|slots| slots.leased.remove(&id));
            if !removed {
                return;
            }
            state.total = state.total.saturating_sub(1);
            Self::prune(&mut state.routes, route);
        }
        self.metrics.total_discarded.fetch_add(1, Ordering::Relaxed);
        self.released.notify_waiters();
    }

    pub(crate) async fn evict_idle(&self, policy: EvictionPolicy) -> usize {
        let victims = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.closed {
                return 0;
            }

            let now = Instant::now();
            let mut victims = Vec::new();
            for slots in state.routes.values_mut() {
                let (evict, keep): (Vec<_>, Vec<_>) = slots
                    .idle
                    .drain(..)
                    .partition(|entry| policy.should_evict(&entry.meta, now));
                slots.idle = keep;
                victims.extend(evict);
            }
            state.total -= victims.len();
            state.routes.retain(|_, slots| !slots.is_empty());
            victims
        };

        let evicted = victims.len();
        if evicted == 0 {
            return 0;
        }
        self.released.notify_waiters();

        for entry in victims {
            let IdleEntry { id, mut connection, .. } = entry;
            if let Err(e) = connection.close().await {
                self.metrics.close_failures.fetch_add(1, Ordering::Relaxed);
                warn!(id, error = %e, "failed to close evicted connection");
            }
        }

        self.metrics.total_evicted.fetch_add(evicted as u64, Ordering::Relaxed);
        debug!(evicted, "evicted idle connections");
        evicted
    }

    pub(crate) async fn close_all(&self) -> Vec<PoolError> {
        let (idle, revoked) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.closed = true;
            state.total = 0;
            let routes = std::mem::take(&mut state.routes);
            let mut idle = Vec::new();
            for slots in routes.into_values() {
                state.revoked.extend(slots.leased);
                idle.extend(slots.idle);
            }
            (idle, state.revoked.len())
        };
        self.shutdown.cancel();
        self.released.notify_waiters();

        if idle.is_empty() && revoked == 0 {
            return Vec::new();
        }
        info!(idle = idle.len(), revoked, "closing all pooled connections");

        let mut failures = Vec::new();
        self.close_entries(idle, &mut failures).await;
        if revoked > 0 {
            self.drain_revoked(&mut failures).await;
        }
        failures
    }

    /// Close revoked connections as their leases are dropped
    ///
    /// Leases still held once the close grace runs out are reported as
    /// failures; their connections are closed in the background when they
    /// finally come back.
    async fn drain_revoked(&self, failures: &mut Vec<PoolError>) {
        let now = tokio::time::Instant::now();
        let deadline = now.checked_add(self.config.close_grace).unwrap_or(now);

        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (returned, outstanding) = {
                let mut state = self.state.lock();
                (std::mem::take(&mut state.returned), state.revoked.len())
            };
            self.close_entries(returned, failures).await;
            if outstanding == 0 {
                return;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        let (returned, stuck) = {
            let mut state = self.state.lock();
            let stuck: Vec<u64> = state.revoked.drain().collect();
            (std::mem::take(&mut state.returned), stuck)
        };
        self.close_entries(returned, failures).await;
        for id in stuck {
            self.metrics.close_failures.fetch_add(1, Ordering::Relaxed);
            warn!(id, grace = ?self.config.close_grace, "leased connection not returned before close grace expired");
            failures.push(PoolError::close_message(
                ResourceKind::Connection,
                format!("connection {id} still leased after {:?}", self.config.close_grace),
            ));
        }
    }

    async fn close_entries(&self, entries: Vec<IdleEntry<C>>, failures: &mut Vec<PoolError>) {
        for entry in entries {
            let IdleEntry { id, mut connection, .. } = entry;
            if let Err(e) = connection.close().await {
                self.metrics.close_failures.fetch_add(1, Ordering::Relaxed);
                warn!(id, error = %e, "failed to close pooled connection");
                failures.push(PoolError::close_io(ResourceKind::Connection, e));
            }
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn eviction_policy(&self) -> EvictionPolicy {
        EvictionPolicy::new(self.config.idle_threshold, self.config.effective_ttl())
    }

    fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let mut stats = PoolStats {
            max_total: self.config.max_total,
            max_per_route: self.config.max_per_route,
            routes: state.routes.len(),
            ..PoolStats::default()
        };
        for slots in state.routes.values() {
            stats.idle += slots.idle.len();
            stats.leased += slots.leased.len();
            stats.pending += slots.pending;
        }
        stats
    }

    fn route_stats(&self, route: &Route) -> PoolStats {
        let state = self.state.lock();
        let mut stats = PoolStats {
            max_total: self.config.max_total,
            max_per_route: self.config.max_per_route,
            ..PoolStats::default()
        };
        if let Some(slots) = state.routes.get(route) {
            stats.routes = 1;
            stats.idle = slots.idle.len();
            stats.leased = slots.leased.len();
            stats.pending = slots.pending;
        }
        stats
    }
}

/// Releases a pending slot if the connect attempt is abandoned
struct Reservation<'a, C: Connection> {
    shared: &'a PoolShared<C>,
    route: &'a Route,
    armed: bool,
}

impl<C: Connection> Reservation<'_, C> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<C: Connection> Drop for Reservation<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.cancel_reservation(self.route);
        }
    }
}

/// Point-in-time occupancy of the pool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub leased: usize,
    pub idle: usize,
    /// Connections currently being established
    pub pending: usize,
    /// Routes with at least one connection
    pub routes: usize,
    pub max_total: usize,
    pub max_per_route: usize,
}

/// Bounded pool of reusable connections keyed by [`Route`]
///
/// The pool is the sole owner of idle connections. Leases and the eviction
/// monitor hold weak references and never outlive its state.
///
/// # Examples
///
/// ```no_run
/// use connpool::{ConnectionPool, HttpConnector, PoolConfig, Route};
///
/// # async fn demo() -> connpool::PoolResult<()> {
/// let config = PoolConfig::new().with_max_total(10).with_max_per_route(2);
/// let connector = HttpConnector::new(&config)?;
/// let pool = ConnectionPool::new(config, connector)?;
///
/// let conn = pool.acquire(&Route::https("example.com", 443)).await?;
/// pool.release(conn);
/// # Ok(())
/// # }
/// ```
pub struct ConnectionPool<K: Connector> {
    shared: Arc<PoolShared<K::Connection>>,
    connector: Arc<K>,
}

impl<K: Connector> Clone for ConnectionPool<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            connector: Arc::clone(&self.connector),
        }
    }
}

impl<K: Connector> ConnectionPool<K> {
    /// Create an empty pool; fails with `Config` when the caps are invalid
    pub fn new(config: impl Into<Arc<PoolConfig>>, connector: K) -> PoolResult<Self> {
        let config = config.into();
        config.validate()?;

        debug!(
            max_total = config.max_total,
            max_per_route = config.max_per_route,
            ttl = ?config.ttl,
            "created connection pool"
        );

        Ok(Self {
            shared: Arc::new(PoolShared {
                config,
                state: Mutex::new(PoolState {
                    routes: HashMap::new(),
                    total: 0,
                    closed: false,
                    revoked: HashSet::new(),
                    returned: Vec::new(),
                }),
                released: Notify::new(),
                shutdown: CancellationToken::new(),
                metrics: MetricsTracker::new(),
                next_id: AtomicU64::new(1),
            }),
            connector: Arc::new(connector),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub(crate) fn shared_config(&self) -> Arc<PoolConfig> {
        Arc::clone(&self.shared.config)
    }

    pub fn connector(&self) -> &K {
        &self.connector
    }

    /// Lease a connection for `route`
    ///
    /// Reuses the most recently released idle connection when one is still
    /// fresh, otherwise opens a new one if both caps allow it. At capacity the
    /// configured [`ExhaustionPolicy`] decides between failing immediately and
    /// waiting for a slot up to a deadline.
    pub async fn acquire(&self, route: &Route) -> PoolResult<PooledConnection<K::Connection>> {
        let deadline = match self.shared.config.exhaustion_policy {
            ExhaustionPolicy::FailFast => None,
            ExhaustionPolicy::WaitFor(wait) => {
                let now = tokio::time::Instant::now();
                Some(now.checked_add(wait).unwrap_or(now + MAX_WAIT))
            }
        };

        loop {
            let notified = self.shared.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (checkout, stale) = self.shared.checkout(route)?;
            self.close_stale(stale).await;

            match checkout {
                Checkout::Reused(entry) => {
                    if !entry.connection.is_open() {
                        self.drop_stale_lease(route, entry).await;
                        continue;
                    }
                    trace!(%route, id = entry.id, "reusing pooled connection");
                    self.shared.metrics.total_reused.fetch_add(1, Ordering::Relaxed);
                    return Ok(self.lease(route, entry.id, entry.connection, entry.meta));
                }
                Checkout::Reserved => return self.open(route).await,
                Checkout::Exhausted => {
                    let exhausted = self.exhausted(route);
                    let Some(deadline) = deadline else {
                        return Err(exhausted);
                    };
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(exhausted);
                    }
                }
            }
        }
    }

    /// Return a leased connection to the pool without closing it
    ///
    /// Releasing a lease the pool no longer tracks, for example one revoked by
    /// [`close_all`](Self::close_all), only drops the connection.
    pub fn release(&self, connection: PooledConnection<K::Connection>) {
        drop(connection);
    }

    /// Remove a leased connection from the pool and close it
    pub async fn discard(&self, mut connection: PooledConnection<K::Connection>) -> PoolResult<()> {
        let Some(mut inner) = connection.connection.take() else {
            return Ok(());
        };
        self.shared.forget(connection.id, &connection.route);
        inner
            .close()
            .await
            .map_err(|e| PoolError::close_io(ResourceKind::Connection, e))
    }

    /// Close and remove every idle connection unused for longer than
    /// `older_than` or older than `ttl`; returns how many were removed
    ///
    /// Leased connections are never touched. A failure to close one
    /// connection is logged and does not stop the sweep.
    pub async fn evict_idle(&self, older_than: Duration, ttl: Duration) -> usize {
        self.shared.evict_idle(EvictionPolicy::new(older_than, ttl)).await
    }

    /// Close every connection, leased or not, and mark the pool closed
    ///
    /// Idle connections are closed at once. Outstanding leases are revoked,
    /// which aborts their I/O, and each one returned within the configured
    /// close grace is closed here. A lease still held after the grace counts
    /// as a failure; its connection is closed in the background once dropped.
    /// Returns one error per connection that failed to close.
    pub async fn close_all(&self) -> Vec<PoolError> {
        self.shared.close_all().await
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Mark the pool closed and drop idle connections without a graceful close
    pub(crate) fn close_now(&self) {
        let routes = {
            let mut state = self.shared.state.lock();
            state.closed = true;
            state.total = 0;
            std::mem::take(&mut state.routes)
        };
        self.shared.shutdown.cancel();
        self.shared.released.notify_waiters();
        drop(routes);
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }

    /// Occupancy of a single route
    pub fn route_stats(&self, route: &Route) -> PoolStats {
        self.shared.route_stats(route)
    }

    /// Get pool metrics
    pub fn get_metrics(&self) -> PoolMetrics {
        self.shared.metrics.get_metrics(&self.stats())
    }

    /// Get health status
    pub fn get_health_status(&self) -> HealthStatus {
        HealthStatus::new(&self.stats(), !self.is_closed())
    }

    pub(crate) fn downgrade(&self) -> Weak<PoolShared<K::Connection>> {
        Arc::downgrade(&self.shared)
    }

    async fn open(&self, route: &Route) -> PoolResult<PooledConnection<K::Connection>> {
        let reservation = Reservation {
            shared: &self.shared,
            route,
            armed: true,
        };
        let timeout = self.shared.config.connect_timeout;

        let mut connection = match tokio::time::timeout(timeout, self.connector.connect(route)).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                self.shared.metrics.connect_failures.fetch_add(1, Ordering::Relaxed);
                warn!(%route, error = %e, "failed to open connection");
                return Err(PoolError::connect(route, e));
            }
            Err(_) => {
                self.shared.metrics.connect_failures.fetch_add(1, Ordering::Relaxed);
                warn!(%route, ?timeout, "connect timed out");
                return Err(PoolError::Timeout(timeout));
            }
        };

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        reservation.disarm();

        if !self.shared.complete_reservation(route, id) {
            if let Err(e) = connection.close().await {
                debug!(%route, error = %e, "failed to close connection opened during shutdown");
            }
            return Err(PoolError::ClosedTransport);
        }

        self.shared.metrics.total_created.fetch_add(1, Ordering::Relaxed);
        debug!(%route, id, "opened new connection");
        Ok(self.lease(route, id, connection, ConnectionMetadata::new()))
    }

    fn lease(
        &self,
        route: &Route,
        id: u64,
        connection: K::Connection,
        meta: ConnectionMetadata,
    ) -> PooledConnection<K::Connection> {
        self.shared.metrics.total_leased.fetch_add(1, Ordering::Relaxed);
        PooledConnection {
            connection: Some(connection),
            id,
            route: route.clone(),
            meta,
            pool: self.downgrade(),
            revoked: self.shared.shutdown.clone(),
            revocation: None,
        }
    }

    /// Give up an idle connection whose peer went away while it sat in the pool
    async fn drop_stale_lease(&self, route: &Route, entry: IdleEntry<K::Connection>) {
        let IdleEntry { id, mut connection, .. } = entry;
        debug!(%route, id, "idle connection no longer open, discarding");
        self.shared.forget(id, route);
        if let Err(e) = connection.close().await {
            trace!(%route, id, error = %e, "close of stale connection failed");
        }
    }

    async fn close_stale(&self, stale: Vec<IdleEntry<K::Connection>>) {
        if stale.is_empty() {
            return;
        }
        self.shared.released.notify_waiters();
        let count = stale.len();
        for entry in stale {
            let IdleEntry { id, mut connection, .. } = entry;
            if let Err(e) = connection.close().await {
                self.shared.metrics.close_failures.fetch_add(1, Ordering::Relaxed);
                warn!(id, error = %e, "failed to close expired connection");
            }
        }
        self.shared.metrics.total_evicted.fetch_add(count as u64, Ordering::Relaxed);
    }

    fn exhausted(&self, route: &Route) -> PoolError {
        self.shared.metrics.exhausted_events.fetch_add(1, Ordering::Relaxed);
        PoolError::PoolExhausted {
            route: route.to_string(),
            max_per_route: self.shared.config.max_per_route,
            max_total: self.shared.config.max_total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::testing::{ScriptedConnector, ScriptedConnection};
    use std::sync::atomic::AtomicUsize;

    fn pool(config: PoolConfig) -> (ConnectionPool<ScriptedConnector>, ScriptedConnector) {
        let connector = ScriptedConnector::new();
        let pool = ConnectionPool::new(config, connector.clone()).unwrap();
        (pool, connector)
    }

    fn small_config() -> PoolConfig {
        PoolConfig::new()
            .with_max_total(2)
            .with_max_per_route(2)
            .with_ttl(Duration::from_millis(1000))
    }

    #[tokio::test]
    async fn test_third_acquire_on_full_route_is_exhausted() {
        let (pool, _) = pool(small_config());
        let route = Route::http("a", 80);

        let first = pool.acquire(&route).await.unwrap();
        let _second = pool.acquire(&route).await.unwrap();

        let err = pool.acquire(&route).await.unwrap_err();
        assert!(matches!(err, PoolError::PoolExhausted { .. }));

        pool.release(first);
        assert!(pool.acquire(&route).await.is_ok());
    }

    #[tokio::test]
    async fn test_release_then_acquire_reuses_connection() {
        let (pool, connector) = pool(small_config());
        let route = Route::http("a", 80);

        let conn = pool.acquire(&route).await.unwrap();
        let id = conn.id();
        let serial = conn.serial;
        pool.release(conn);

        let again = pool.acquire(&route).await.unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(again.serial, serial);
        assert_eq!(connector.opened(), 1);
    }

    #[tokio::test]
    async fn test_global_cap_across_routes() {
        let config = PoolConfig::new().with_max_total(2).with_max_per_route(2);
        let (pool, _) = pool(config);

        let _a = pool.acquire(&Route::http("a", 80)).await.unwrap();
        let _b = pool.acquire(&Route::http("b", 80)).await.unwrap();
        let err = pool.acquire(&Route::http("c", 80)).await.unwrap_err();
        assert!(matches!(err, PoolError::PoolExhausted { .. }));

        let stats = pool.stats();
        assert_eq!(stats.leased, 2);
        assert_eq!(stats.routes, 2);
    }

    #[tokio::test]
    async fn test_idle_connection_of_other_route_is_recycled_at_global_cap() {
        let config = PoolConfig::new().with_max_total(1).with_max_per_route(1);
        let (pool, connector) = pool(config);

        let a = pool.acquire(&Route::http("a", 80)).await.unwrap();
        pool.release(a);

        let b = pool.acquire(&Route::http("b", 80)).await.unwrap();
        assert_eq!(b.route(), &Route::http("b", 80));
        assert_eq!(connector.closed(), 1);
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test]
    async fn test_caps_hold_under_concurrency() {
        let config = PoolConfig::new().with_max_total(4).with_max_per_route(3);
        let (pool, _) = pool(config);
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for i in 0..32 {
            let pool = pool.clone();
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                let route = Route::http(if i % 2 == 0 { "a" } else { "b" }, 80);
                if let Ok(conn) = pool.acquire(&route).await {
                    let stats = pool.stats();
                    peak.fetch_max(stats.leased + stats.pending, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    pool.release(conn);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 4);
        let stats = pool.stats();
        assert_eq!(stats.leased, 0);
        assert!(stats.idle <= 4);
    }

    #[tokio::test]
    async fn test_evict_idle_skips_leased_connections() {
        let (pool, connector) = pool(small_config());
        let route = Route::http("a", 80);

        let held = pool.acquire(&route).await.unwrap();
        let idle = pool.acquire(&route).await.unwrap();
        pool.release(idle);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let evicted = pool.evict_idle(Duration::from_millis(10), Duration::MAX).await;

        assert_eq!(evicted, 1);
        assert_eq!(connector.closed(), 1);
        assert_eq!(pool.stats().leased, 1);
        drop(held);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_evict_idle_by_ttl() {
        let (pool, _) = pool(small_config());
        let route = Route::http("a", 80);

        let conn = pool.acquire(&route).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        pool.release(conn);

        assert_eq!(pool.evict_idle(Duration::MAX, Duration::from_secs(60)).await, 0);
        assert_eq!(pool.evict_idle(Duration::MAX, Duration::from_millis(10)).await, 1);
        assert_eq!(pool.stats().routes, 0);
    }

    #[tokio::test]
    async fn test_eviction_continues_past_close_failures() {
        let (pool, connector) = pool(PoolConfig::new().with_max_per_route(3).with_max_total(3));
        let route = Route::http("a", 80);
        connector.fail_close_on(&[1]);

        let conns = vec![
            pool.acquire(&route).await.unwrap(),
            pool.acquire(&route).await.unwrap(),
            pool.acquire(&route).await.unwrap(),
        ];
        for conn in conns {
            pool.release(conn);
        }

        let evicted = pool.evict_idle(Duration::ZERO, Duration::MAX).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(evicted, 3);
        assert_eq!(connector.closed(), 2);
        assert_eq!(pool.get_metrics().close_failures, 1);
    }

    #[tokio::test]
    async fn test_close_all_reports_failures_and_unreturned_leases() {
        let config = PoolConfig::new()
            .with_max_per_route(3)
            .with_max_total(3)
            .with_close_grace(Duration::from_millis(50));
        let (pool, connector) = pool(config);
        let route = Route::http("a", 80);
        connector.fail_close_on(&[2]);

        let leased = pool.acquire(&route).await.unwrap();
        let a = pool.acquire(&route).await.unwrap();
        let b = pool.acquire(&route).await.unwrap();
        pool.release(a);
        pool.release(b);

        let failures = pool.close_all().await;
        assert_eq!(failures.len(), 2);
        assert!(failures.iter().all(|f| matches!(
            f,
            PoolError::ResourceClose { resource: ResourceKind::Connection, .. }
        )));
        assert!(pool.is_closed());
        assert!(leased.is_revoked());
        assert_eq!(connector.closed(), 1);

        // Returned after the grace period: closed in the background
        pool.release(leased);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(connector.closed(), 2);

        assert_eq!(pool.stats(), PoolStats { max_total: 3, max_per_route: 3, ..Default::default() });
        assert!(matches!(pool.acquire(&route).await, Err(PoolError::ClosedTransport)));
        assert!(pool.close_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_close_all_closes_lease_returned_during_grace() {
        let config = small_config().with_close_grace(Duration::from_secs(5));
        let (pool, connector) = pool(config);
        let route = Route::http("a", 80);

        let held = pool.acquire(&route).await.unwrap();
        let holder = tokio::spawn(async move {
            held.revoked().await;
            drop(held);
        });

        let started = Instant::now();
        let failures = pool.close_all().await;
        holder.await.unwrap();

        assert!(failures.is_empty());
        assert_eq!(connector.closed(), 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_close_all_reports_close_failure_of_returned_lease() {
        let config = small_config().with_close_grace(Duration::from_secs(5));
        let (pool, connector) = pool(config);
        connector.fail_close_on(&[1]);

        let held = pool.acquire(&Route::http("a", 80)).await.unwrap();
        let holder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(held);
        });

        let failures = pool.close_all().await;
        holder.await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(pool.get_metrics().close_failures, 1);
    }

    #[tokio::test]
    async fn test_acquire_skips_idle_connection_closed_by_peer() {
        let (pool, connector) = pool(small_config());
        let route = Route::http("a", 80);

        let conn = pool.acquire(&route).await.unwrap();
        let stale_id = conn.id();
        pool.release(conn);
        connector.hang_up_all();

        let fresh = pool.acquire(&route).await.unwrap();
        assert_ne!(fresh.id(), stale_id);
        assert_eq!(connector.opened(), 2);
        assert_eq!(pool.stats().leased, 1);
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test]
    async fn test_longest_allowed_wait_does_not_overflow() {
        let config = PoolConfig::new()
            .with_max_total(1)
            .with_max_per_route(1)
            .with_exhaustion_policy(ExhaustionPolicy::WaitFor(MAX_WAIT));
        let (pool, _) = pool(config);

        assert!(pool.acquire(&Route::http("a", 80)).await.is_ok());

        let unbounded = PoolConfig::new().with_exhaustion_policy(ExhaustionPolicy::WaitFor(Duration::MAX));
        let result = ConnectionPool::new(unbounded, ScriptedConnector::new());
        assert!(matches!(result, Err(PoolError::Config(_))));
    }

    #[tokio::test]
    async fn test_failed_connect_frees_slot() {
        let config = PoolConfig::new().with_max_total(1).with_max_per_route(1);
        let (pool, connector) = pool(config);
        let route = Route::http("a", 80);

        connector.fail_next_connect();
        assert!(matches!(pool.acquire(&route).await, Err(PoolError::Connect { .. })));
        assert_eq!(pool.stats().pending, 0);
        assert!(pool.acquire(&route).await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_policy_picks_up_released_connection() {
        let config = PoolConfig::new()
            .with_max_total(1)
            .with_max_per_route(1)
            .with_exhaustion_policy(ExhaustionPolicy::WaitFor(Duration::from_secs(2)));
        let (pool, _) = pool(config);
        let route = Route::http("a", 80);

        let held = pool.acquire(&route).await.unwrap();
        let id = held.id();
        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(held);
        });

        let conn = pool.acquire(&route).await.unwrap();
        assert_eq!(conn.id(), id);
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_policy_gives_up_at_deadline() {
        let config = PoolConfig::new()
            .with_max_total(1)
            .with_max_per_route(1)
            .with_exhaustion_policy(ExhaustionPolicy::WaitFor(Duration::from_millis(30)));
        let (pool, _) = pool(config);
        let route = Route::http("a", 80);

        let _held = pool.acquire(&route).await.unwrap();
        let started = Instant::now();
        let err = pool.acquire(&route).await.unwrap_err();
        assert!(matches!(err, PoolError::PoolExhausted { .. }));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_closed_connection_is_not_pooled() {
        let (pool, connector) = pool(small_config());
        let route = Route::http("a", 80);

        let mut conn = pool.acquire(&route).await.unwrap();
        conn.mark_broken();
        pool.release(conn);

        assert_eq!(pool.stats().idle, 0);
        let _fresh = pool.acquire(&route).await.unwrap();
        assert_eq!(connector.opened(), 2);
    }

    #[tokio::test]
    async fn test_discard_and_detach_free_slots() {
        let config = PoolConfig::new().with_max_total(1).with_max_per_route(1);
        let (pool, connector) = pool(config);
        let route = Route::http("a", 80);

        let conn = pool.acquire(&route).await.unwrap();
        pool.discard(conn).await.unwrap();
        assert_eq!(connector.closed(), 1);

        let conn = pool.acquire(&route).await.unwrap();
        let raw: ScriptedConnection = conn.detach();
        assert_eq!(pool.stats().leased, 0);
        drop(raw);
        assert!(pool.acquire(&route).await.is_ok());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = ConnectionPool::new(PoolConfig::new().with_max_total(0), ScriptedConnector::new());
        assert!(matches!(result, Err(PoolError::Config(_))));
    }
}
