//! Pool and transport configuration options

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::errors::{PoolError, PoolResult};
use crate::interceptor::Interceptor;

const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(5);
const MIN_MONITOR_INTERVAL: Duration = Duration::from_millis(10);
const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(1);
/// Upper bound for any configured wait: exhaustion waits and the close grace
pub const MAX_WAIT: Duration = Duration::from_secs(3600);

/// What `acquire` does when a route or the whole pool is at capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExhaustionPolicy {
    /// Fail immediately with `PoolExhausted`
    #[default]
    FailFast,

    /// Wait for a release or eviction, up to the given deadline
    WaitFor(Duration),
}

/// Credentials for an HTTP proxy the transport tunnels through
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyCredentials {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyCredentials {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Value for a `Proxy-Authorization` header, if credentials are set
    pub fn authorization(&self) -> Option<String> {
        let user = self.username.as_deref()?;
        let pass = self.password.as_deref().unwrap_or_default();
        Some(format!("Basic {}", STANDARD.encode(format!("{user}:{pass}"))))
    }

    fn validate(&self) -> PoolResult<()> {
        if self.host.trim().is_empty() || self.host.chars().any(char::is_whitespace) {
            return Err(PoolError::config(format!("malformed proxy host '{}'", self.host)));
        }
        if self.port == 0 {
            return Err(PoolError::config("proxy port must be non-zero"));
        }
        match (&self.username, &self.password) {
            (None, Some(_)) => Err(PoolError::config("proxy password given without a username")),
            (Some(user), _) if user.is_empty() || user.contains(':') => Err(PoolError::config(
                "proxy username must be non-empty and must not contain ':'",
            )),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for ProxyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCredentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Configuration snapshot for the pool and the transport built on it
///
/// # Examples
///
/// ```
/// use connpool::PoolConfig;
/// use std::time::Duration;
///
/// let config = PoolConfig::new()
///     .with_max_total(50)
///     .with_max_per_route(10)
///     .with_ttl(Duration::from_secs(60));
///
/// assert!(config.validate().is_ok());
/// assert_eq!(config.max_total, 50);
/// assert_eq!(config.ttl, Some(Duration::from_secs(60)));
/// ```
#[derive(Clone)]
pub struct PoolConfig {
    /// Maximum number of connections across all routes
    pub max_total: usize,

    /// Maximum number of connections to a single route
    pub max_per_route: usize,

    /// Maximum connection age; `None` never expires by age
    pub ttl: Option<Duration>,

    /// Unused duration after which an idle connection is evicted
    pub idle_threshold: Duration,

    /// Sweep period of the eviction monitor; derived from the TTL when unset
    pub monitor_interval: Option<Duration>,

    /// Timeout for establishing a new connection, TLS handshake included
    pub connect_timeout: Duration,

    pub exhaustion_policy: ExhaustionPolicy,

    /// How long `close_all` waits for revoked leases to come back before
    /// reporting them as failed to close
    pub close_grace: Duration,

    /// Verify server certificates and hostnames
    pub verify_ssl: bool,

    pub follow_redirects: bool,

    pub cookie_management: bool,

    pub proxy: Option<ProxyCredentials>,

    /// Additional PEM trust roots loaded on top of the bundled web PKI roots
    pub ca_certificates: Option<PathBuf>,

    pub interceptors: Vec<Arc<dyn Interceptor>>,

    /// Install an exit hook that shuts the runtime down on SIGINT/SIGTERM
    pub add_shutdown_hook: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: 200,
            max_per_route: 20,
            ttl: None,
            idle_threshold: Duration::from_secs(30),
            monitor_interval: None,
            connect_timeout: Duration::from_secs(10),
            exhaustion_policy: ExhaustionPolicy::FailFast,
            close_grace: DEFAULT_CLOSE_GRACE,
            verify_ssl: true,
            follow_redirects: true,
            cookie_management: true,
            proxy: None,
            ca_certificates: None,
            interceptors: Vec::new(),
            add_shutdown_hook: false,
        }
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let interceptors: Vec<&str> = self.interceptors.iter().map(|i| i.name()).collect();
        f.debug_struct("PoolConfig")
            .field("max_total", &self.max_total)
            .field("max_per_route", &self.max_per_route)
            .field("ttl", &self.ttl)
            .field("idle_threshold", &self.idle_threshold)
            .field("monitor_interval", &self.monitor_interval)
            .field("connect_timeout", &self.connect_timeout)
            .field("exhaustion_policy", &self.exhaustion_policy)
            .field("close_grace", &self.close_grace)
            .field("verify_ssl", &self.verify_ssl)
            .field("follow_redirects", &self.follow_redirects)
            .field("cookie_management", &self.cookie_management)
            .field("proxy", &self.proxy)
            .field("ca_certificates", &self.ca_certificates)
            .field("interceptors", &interceptors)
            .field("add_shutdown_hook", &self.add_shutdown_hook)
            .finish()
    }
}

impl PoolConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of connections across all routes
    pub fn with_max_total(mut self, max: usize) -> Self {
        self.max_total = max;
        self
    }

    /// Set the maximum number of connections per route
    pub fn with_max_per_route(mut self, max: usize) -> Self {
        self.max_per_route = max;
        self
    }

    /// Set the connection time-to-live
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Set the TTL in milliseconds; zero or negative means unlimited
    ///
    /// ```
    /// use connpool::PoolConfig;
    ///
    /// assert_eq!(PoolConfig::new().with_ttl_millis(-1).ttl, None);
    /// assert!(PoolConfig::new().with_ttl_millis(1500).ttl.is_some());
    /// ```
    pub fn with_ttl_millis(mut self, millis: i64) -> Self {
        self.ttl = u64::try_from(millis)
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);
        self
    }

    pub fn with_idle_threshold(mut self, threshold: Duration) -> Self {
        self.idle_threshold = threshold;
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = Some(interval);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_exhaustion_policy(mut self, policy: ExhaustionPolicy) -> Self {
        self.exhaustion_policy = policy;
        self
    }

    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    pub fn with_verify_ssl(mut self, verify: bool) -> Self {
        self.verify_ssl = verify;
        self
    }

    pub fn with_follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    pub fn with_cookie_management(mut self, enabled: bool) -> Self {
        self.cookie_management = enabled;
        self
    }

    pub fn with_proxy(mut self, proxy: ProxyCredentials) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_ca_certificates(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_certificates = Some(path.into());
        self
    }

    /// Append an interceptor; interceptors run in insertion order
    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn with_shutdown_hook(mut self, enabled: bool) -> Self {
        self.add_shutdown_hook = enabled;
        self
    }

    /// Sweep period used by the eviction monitor
    ///
    /// Defaults to five seconds, shortened to half the TTL for short-lived
    /// connections.
    pub fn effective_monitor_interval(&self) -> Duration {
        let interval = match (self.monitor_interval, self.ttl) {
            (Some(interval), _) => interval,
            (None, Some(ttl)) => DEFAULT_MONITOR_INTERVAL.min(ttl / 2),
            (None, None) => DEFAULT_MONITOR_INTERVAL,
        };
        interval.max(MIN_MONITOR_INTERVAL)
    }

    /// TTL as a plain duration; unlimited maps to `Duration::MAX`
    pub fn effective_ttl(&self) -> Duration {
        self.ttl.unwrap_or(Duration::MAX)
    }

    /// Check the caps and credentials
    pub fn validate(&self) -> PoolResult<()> {
        if self.max_total == 0 {
            return Err(PoolError::config("max_total must be greater than zero"));
        }
        if self.max_per_route == 0 {
            return Err(PoolError::config("max_per_route must be greater than zero"));
        }
        if self.max_per_route > self.max_total {
            return Err(PoolError::config(format!(
                "max_per_route ({}) exceeds max_total ({})",
                self.max_per_route, self.max_total
            )));
        }
        if self.connect_timeout.is_zero() {
            return Err(PoolError::config("connect_timeout must be non-zero"));
        }
        if matches!(self.monitor_interval, Some(i) if i.is_zero()) {
            return Err(PoolError::config("monitor_interval must be non-zero"));
        }
        if let ExhaustionPolicy::WaitFor(wait) = self.exhaustion_policy
            && wait > MAX_WAIT
        {
            return Err(PoolError::config(format!(
                "exhaustion wait {wait:?} exceeds the maximum of {MAX_WAIT:?}"
            )));
        }
        if self.close_grace > MAX_WAIT {
            return Err(PoolError::config(format!(
                "close_grace {:?} exceeds the maximum of {MAX_WAIT:?}",
                self.close_grace
            )));
        }
        if let Some(proxy) = &self.proxy {
            proxy.validate()?;
        }
        Ok(())
    }
}
