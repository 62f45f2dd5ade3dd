//! # connpool
//!
//! Pooled HTTP client transport for tokio with background idle eviction
//! and a failure-tolerant, run-once shutdown.
//!
//! ## Features
//!
//! - Connection pool with global and per-route caps
//! - Automatic return of connections via RAII (Drop trait)
//! - Fail-fast or bounded-wait behaviour on exhaustion
//! - Background eviction of idle and expired connections
//! - TLS through rustls, with an explicit opt-in for skipping verification
//! - HTTP CONNECT proxies with Basic authentication
//! - Request interceptors around every exchange
//! - Health monitoring and metrics
//! - Prometheus metrics export
//! - Ordered shutdown that reports every failure and runs once
//!
//! ## Quick Start
//!
//! ```no_run
//! use connpool::{ClientRuntime, PoolConfig, Route};
//! use std::time::Duration;
//!
//! # async fn demo() -> connpool::PoolResult<()> {
//! let config = PoolConfig::new()
//!     .with_max_total(100)
//!     .with_max_per_route(10)
//!     .with_idle_threshold(Duration::from_secs(30));
//!
//! let runtime = ClientRuntime::start(config)?;
//! let client = runtime.client()?;
//! {
//!     let exchange = client.exchange(&Route::https("example.com", 443)).await?;
//!     println!("using connection {}", exchange.id());
//!     // Connection automatically returned when `exchange` goes out of scope
//! }
//!
//! let result = runtime.shutdown().await;
//! println!("{result}");
//! # Ok(())
//! # }
//! ```

mod config;
mod connector;
mod errors;
mod eviction;
mod health;
mod interceptor;
mod metrics;
mod monitor;
mod pool;
mod route;
mod runtime;
mod shutdown;
mod tls;
mod transport;

pub use config::{ExhaustionPolicy, MAX_WAIT, PoolConfig, ProxyCredentials};
pub use connector::{Connection, Connector, HttpConnector, HttpStream};
pub use errors::{PoolError, PoolResult, ResourceKind};
pub use eviction::EvictionPolicy;
pub use health::HealthStatus;
pub use interceptor::Interceptor;
#[cfg(feature = "metrics")]
pub use metrics::MetricsExporter;
pub use metrics::PoolMetrics;
pub use monitor::IdleEvictionMonitor;
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use route::{Route, Scheme};
pub use runtime::ClientRuntime;
pub use shutdown::{Closeable, ShutdownCoordinator, ShutdownFailure, ShutdownResult};
pub use tls::TlsPolicy;
pub use transport::{Exchange, HttpClient, TransportHandle, TransportState};
