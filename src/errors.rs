//! Error types for the connection pool and its transport

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// A resource that takes part in eviction or shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// A single pooled connection
    Connection,
    /// The transport handle
    Transport,
    /// The connection pool as a whole
    Pool,
    /// The idle-eviction monitor task
    Monitor,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Connection => "connection",
            ResourceKind::Transport => "transport",
            ResourceKind::Pool => "pool",
            ResourceKind::Monitor => "monitor",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone)]
pub enum PoolError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Pool exhausted for {route} (max per route {max_per_route}, max total {max_total})")]
    PoolExhausted {
        route: String,
        max_per_route: usize,
        max_total: usize,
    },

    #[error("Transport is closed")]
    ClosedTransport,

    #[error("Failed to close {resource}: {message}")]
    ResourceClose {
        resource: ResourceKind,
        message: String,
        #[source]
        source: Option<Arc<std::io::Error>>,
    },

    #[error("Failed to connect to {route}: {source}")]
    Connect {
        route: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Interceptor {interceptor} rejected the exchange: {reason}")]
    Rejected { interceptor: String, reason: String },
}

impl PoolError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        PoolError::Config(message.into())
    }

    /// Wrap an I/O failure raised while closing `resource`
    pub(crate) fn close_io(resource: ResourceKind, err: std::io::Error) -> Self {
        PoolError::ResourceClose {
            resource,
            message: err.to_string(),
            source: Some(Arc::new(err)),
        }
    }

    pub(crate) fn close_message(resource: ResourceKind, message: impl Into<String>) -> Self {
        PoolError::ResourceClose {
            resource,
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn connect(route: impl fmt::Display, err: std::io::Error) -> Self {
        PoolError::Connect {
            route: route.to_string(),
            source: Arc::new(err),
        }
    }

    /// Whether the caller may retry the operation later
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PoolError::PoolExhausted { .. } | PoolError::Timeout(_) | PoolError::Connect { .. }
        )
    }
}

pub type PoolResult<T> = Result<T, PoolError>;
