// connpool demo binary
// Starts a client runtime, prints its health and metrics, then shuts it down.
// Run the full walkthrough with: cargo run --example lifecycle

use connpool::{ClientRuntime, PoolConfig, PoolError, PoolResult};
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() -> PoolResult<()> {
    init_logging()?;

    println!("=== connpool ===");
    println!("See demos/ directory for usage examples");
    println!("Run: cargo run --example lifecycle");
    println!();

    let config = PoolConfig::new()
        .with_max_total(20)
        .with_max_per_route(5)
        .with_idle_threshold(Duration::from_secs(30))
        .with_shutdown_hook(true);

    let runtime = ClientRuntime::start(config)?;

    let health = runtime.health();
    println!("Healthy: {}", health.is_healthy());
    println!("Capacity: {}", health.total_capacity);

    let metrics = runtime.pool().get_metrics();
    let mut exported: Vec<_> = metrics.export().into_iter().collect();
    exported.sort();
    for (key, value) in exported {
        println!("  {key}: {value}");
    }

    let result = runtime.shutdown().await;
    println!("Shutdown: {result}");
    Ok(())
}

fn init_logging() -> PoolResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| PoolError::Config(format!("Invalid log filter: {e}")))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();

    Ok(())
}
