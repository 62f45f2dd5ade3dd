//! Pooling key: the destination a connection is opened against

use std::fmt;
use std::str::FromStr;

use crate::errors::{PoolError, PoolResult};

/// Transport scheme of a route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    /// Port used when a URL does not carry one
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn is_secure(self) -> bool {
        matches!(self, Scheme::Https)
    }

    fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Destination identity a connection is pooled under
///
/// Two routes are equal iff scheme, host and port all match. Hosts are
/// compared case-insensitively by normalizing to lowercase on construction.
///
/// # Examples
///
/// ```
/// use connpool::{Route, Scheme};
///
/// let route: Route = "https://Example.com".parse().unwrap();
/// assert_eq!(route, Route::new(Scheme::Https, "example.com", 443));
/// assert_eq!(route.to_string(), "https://example.com:443");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl Route {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into().to_ascii_lowercase(),
            port,
        }
    }

    pub fn http(host: impl Into<String>, port: u16) -> Self {
        Self::new(Scheme::Http, host, port)
    }

    pub fn https(host: impl Into<String>, port: u16) -> Self {
        Self::new(Scheme::Https, host, port)
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, as used for socket addresses and CONNECT targets
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.authority())
    }
}

impl FromStr for Route {
    type Err = PoolError;

    /// Parse `scheme://host[:port][/path...]`; anything after the authority is ignored
    fn from_str(s: &str) -> PoolResult<Self> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| PoolError::config(format!("missing scheme in '{s}'")))?;

        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => return Err(PoolError::config(format!("unsupported scheme '{other}'"))),
        };

        let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
        let authority = authority.rsplit_once('@').map_or(authority, |(_, a)| a);

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| PoolError::config(format!("unterminated IPv6 host in '{s}'")))?;
            (host, tail.strip_prefix(':'))
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        if host.is_empty() {
            return Err(PoolError::config(format!("missing host in '{s}'")));
        }

        let port = match port {
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| PoolError::config(format!("invalid port '{p}' in '{s}'")))?,
            None => scheme.default_port(),
        };

        Ok(Route::new(scheme, host, port))
    }
}
