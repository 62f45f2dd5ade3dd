/// HTTP Transport Integration Tests
///
/// These tests run the default TCP connector against loopback servers.

use connpool::{
    ClientRuntime, ConnectionPool, HttpConnector, PoolConfig, PoolError, ProxyCredentials, Route,
    TlsPolicy, TransportHandle,
};
use std::io::ErrorKind;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Echo server that counts accepted connections
async fn echo_server() -> (u16, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepted = Arc::new(AtomicUsize::new(0));

    let counter = accepted.clone();
    tokio::spawn(async move {
        loop {
            if let Ok((mut stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        }
    });

    (port, accepted)
}

#[tokio::test]
async fn exchanges_reuse_one_tcp_connection() {
    let (port, accepted) = echo_server().await;
    let runtime = ClientRuntime::start(PoolConfig::new().with_max_total(4).with_max_per_route(2)).unwrap();
    let client = runtime.client().unwrap();
    let route = Route::http("127.0.0.1", port);

    for round in 0..3u8 {
        let mut exchange = client.exchange(&route).await.unwrap();
        assert!(!exchange.is_tls());

        exchange.write_all(&[round; 4]).await.unwrap();
        let mut reply = [0u8; 4];
        exchange.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [round; 4]);
    }

    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert!(runtime.shutdown().await.is_clean());
}

#[tokio::test]
async fn refused_connect_frees_the_slot() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let config = PoolConfig::new().with_max_total(1).with_max_per_route(1);
    let pool = ConnectionPool::new(config.clone(), HttpConnector::new(&config).unwrap()).unwrap();
    let route = Route::http("127.0.0.1", port);

    let err = pool.acquire(&route).await.err().unwrap();
    assert!(matches!(err, PoolError::Connect { .. }));
    assert_eq!(pool.stats().pending, 0);
    assert_eq!(pool.get_metrics().connect_failures, 1);
}

#[tokio::test]
async fn close_all_aborts_read_pending_on_lease() {
    let (port, _) = echo_server().await;
    let config = PoolConfig::new().with_max_total(2).with_max_per_route(2);
    let pool = ConnectionPool::new(config.clone(), HttpConnector::new(&config).unwrap()).unwrap();
    let mut lease = pool.acquire(&Route::http("127.0.0.1", port)).await.unwrap();

    let reader = tokio::spawn(async move {
        let mut buf = [0u8; 8];
        let err = lease.read(&mut buf).await.unwrap_err();
        drop(lease);
        err.kind()
    });
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    assert!(pool.close_all().await.is_empty());
    assert_eq!(reader.await.unwrap(), ErrorKind::ConnectionAborted);
    assert_eq!(pool.stats().leased, 0);
}

#[tokio::test]
async fn idle_socket_closed_by_peer_is_replaced() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            // The first connection is hung up at once; later ones stay open
            if counter.fetch_add(1, Ordering::SeqCst) > 0 {
                tokio::spawn(async move {
                    let _stream = stream;
                    std::future::pending::<()>().await;
                });
            }
        }
    });

    let config = PoolConfig::new().with_max_total(2).with_max_per_route(2);
    let pool = ConnectionPool::new(config.clone(), HttpConnector::new(&config).unwrap()).unwrap();
    let route = Route::http("127.0.0.1", port);

    let first = pool.acquire(&route).await.unwrap();
    let first_id = first.id();
    pool.release(first);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let second = pool.acquire(&route).await.unwrap();
    assert_ne!(second.id(), first_id);
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
    drop(second);
    assert!(pool.close_all().await.is_empty());
}

#[tokio::test]
async fn https_route_tunnels_through_proxy() {
    let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_port = proxy.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut stream, _) = proxy.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 512];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await.unwrap();
            request.extend_from_slice(&buf[..n]);
        }
        stream
            .write_all(b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
        String::from_utf8(request).unwrap()
    });

    let config = PoolConfig::new()
        .with_proxy(ProxyCredentials::new("127.0.0.1", proxy_port).with_basic_auth("user", "pass"));
    let transport = TransportHandle::from_config(config).unwrap();
    let client = transport.client().unwrap();

    let err = client.exchange(&Route::https("upstream.example", 443)).await.err().unwrap();
    match err {
        PoolError::Connect { source, .. } => assert_eq!(source.kind(), ErrorKind::ConnectionRefused),
        other => panic!("unexpected error: {other}"),
    }

    let request = server.await.unwrap();
    assert!(request.starts_with("CONNECT upstream.example:443 HTTP/1.1\r\n"));
    assert!(request.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));

    transport.close().await.unwrap();
}

#[tokio::test]
async fn insecure_policy_is_reported() {
    let runtime = ClientRuntime::start(PoolConfig::new().with_verify_ssl(false)).unwrap();
    assert_eq!(runtime.transport().tls_policy(), TlsPolicy::InsecureTrustAll);
    assert!(runtime.shutdown().await.is_clean());
}

#[tokio::test]
async fn missing_ca_bundle_fails_start() {
    let config = PoolConfig::new().with_ca_certificates("/nonexistent/ca-bundle.pem");
    assert!(matches!(ClientRuntime::start(config), Err(PoolError::Config(_))));
}
