//! Lifecycle walkthrough: lease, reuse, exhaustion, eviction, shutdown

use connpool::{
    ClientRuntime, ExhaustionPolicy, Interceptor, PoolConfig, PoolError, Route,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::sleep;

struct Logging;

impl Interceptor for Logging {
    fn name(&self) -> &str {
        "logging"
    }

    fn before_exchange(&self, route: &Route) -> Result<(), String> {
        println!("   -> exchange with {}", route);
        Ok(())
    }

    fn after_exchange(&self, route: &Route) {
        println!("   <- done with {}", route);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== connpool - Lifecycle Examples ===\n");

    // Local server so the walkthrough needs no network access
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let config = PoolConfig::new()
        .with_max_total(2)
        .with_max_per_route(2)
        .with_idle_threshold(Duration::from_millis(200))
        .with_monitor_interval(Duration::from_millis(50))
        .with_interceptor(Arc::new(Logging));

    let runtime = ClientRuntime::start(config)?;
    let route = Route::http("127.0.0.1", port);

    // Example 1: Lease and reuse
    reuse(&runtime, &route).await?;

    // Example 2: Exhaustion
    exhaustion(&runtime, &route).await?;

    // Example 3: Idle eviction
    eviction(&runtime).await;

    // Example 4: Bounded wait
    bounded_wait(port).await?;

    // Example 5: Shutdown
    println!("5. Shutdown:");
    let first = runtime.shutdown().await;
    let second = runtime.shutdown().await;
    println!("   First:  {}", first);
    println!("   Second: {}", second);
    match runtime.client() {
        Ok(_) => println!("   Client still available"),
        Err(e) => println!("   Error: {}", e),
    }

    Ok(())
}

async fn reuse(runtime: &ClientRuntime, route: &Route) -> Result<(), PoolError> {
    println!("1. Lease and reuse:");
    let client = runtime.client()?;

    let first_id = {
        let exchange = client.exchange(route).await?;
        println!("   Leased connection {}", exchange.id());
        exchange.id()
    };

    let exchange = client.exchange(route).await?;
    println!("   Reused connection: {}", exchange.id() == first_id);
    println!();
    Ok(())
}

async fn exhaustion(runtime: &ClientRuntime, route: &Route) -> Result<(), PoolError> {
    println!("2. Exhaustion:");
    let pool = runtime.pool();

    let _a = pool.acquire(route).await?;
    let _b = pool.acquire(route).await?;
    match pool.acquire(route).await {
        Ok(_) => println!("   Got a third connection"),
        Err(e) => println!("   Error: {}", e),
    }

    let stats = pool.stats();
    println!("   Leased: {}, idle: {}", stats.leased, stats.idle);
    println!();
    Ok(())
}

async fn eviction(runtime: &ClientRuntime) {
    println!("3. Idle eviction:");
    println!("   Idle before: {}", runtime.pool().stats().idle);

    sleep(Duration::from_millis(400)).await;

    println!("   Idle after:  {}", runtime.pool().stats().idle);
    println!("   Sweeps run:  {}", runtime.monitor().sweeps());
    println!("   Evicted:     {}", runtime.pool().get_metrics().total_evicted);
    println!();
}

async fn bounded_wait(port: u16) -> Result<(), PoolError> {
    println!("4. Bounded wait:");
    let config = PoolConfig::new()
        .with_max_total(1)
        .with_max_per_route(1)
        .with_exhaustion_policy(ExhaustionPolicy::WaitFor(Duration::from_millis(500)));

    let runtime = ClientRuntime::start(config)?;
    let pool = runtime.pool().clone();
    let route = Route::http("127.0.0.1", port);

    let held = pool.acquire(&route).await?;
    let waiter = tokio::spawn({
        let pool = pool.clone();
        let route = route.clone();
        async move { pool.acquire(&route).await.map(|conn| conn.id()) }
    });

    sleep(Duration::from_millis(100)).await;
    let held_id = held.id();
    drop(held);

    match waiter.await {
        Ok(Ok(id)) => println!("   Waiter got connection {} (released {})", id, held_id),
        Ok(Err(e)) => println!("   Error: {}", e),
        Err(e) => println!("   Waiter panicked: {}", e),
    }

    println!("   {}", runtime.shutdown().await);
    println!();
    Ok(())
}
