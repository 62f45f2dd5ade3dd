//! Exchange interceptors applied by the transport

use crate::route::Route;

/// Hook run around every exchange issued through an [`HttpClient`](crate::HttpClient)
///
/// Interceptors run in the order they were configured. Returning `Err` from
/// [`before_exchange`](Interceptor::before_exchange) vetoes the exchange
/// before a connection is leased.
pub trait Interceptor: Send + Sync {
    /// Name reported in diagnostics and rejection errors
    fn name(&self) -> &str;

    fn before_exchange(&self, _route: &Route) -> Result<(), String> {
        Ok(())
    }

    fn after_exchange(&self, _route: &Route) {}
}
