//! Opening and closing network connections for a route

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::{debug, trace};

use crate::config::{PoolConfig, ProxyCredentials};
use crate::errors::PoolResult;
use crate::route::{Route, Scheme};
use crate::tls::{self, TlsPolicy};

const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

/// A live connection owned by the pool
#[async_trait]
pub trait Connection: Send + 'static {
    /// Close the connection, flushing any buffered output
    async fn close(&mut self) -> io::Result<()>;

    /// Whether the connection can still be reused
    fn is_open(&self) -> bool {
        true
    }
}

/// Opens connections for the pool
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection;

    async fn connect(&self, route: &Route) -> io::Result<Self::Connection>;
}

/// Plain or TLS-wrapped TCP stream
pub enum HttpStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl HttpStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, HttpStream::Tls(_))
    }

    fn tcp(&self) -> &TcpStream {
        match self {
            HttpStream::Plain(stream) => stream,
            HttpStream::Tls(stream) => stream.get_ref().0,
        }
    }
}

impl AsyncRead for HttpStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            HttpStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            HttpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for HttpStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            HttpStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            HttpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            HttpStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            HttpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            HttpStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            HttpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

#[async_trait]
impl Connection for HttpStream {
    async fn close(&mut self) -> io::Result<()> {
        match self.shutdown().await {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    /// An idle keep-alive socket is reusable only while nothing is readable:
    /// EOF means the peer closed it, and unsolicited bytes (a TLS
    /// close_notify included) leave the stream out of sync.
    fn is_open(&self) -> bool {
        let mut peek = [0u8; 1];
        let mut buf = ReadBuf::new(&mut peek);
        let mut cx = Context::from_waker(Waker::noop());
        match self.tcp().poll_peek(&mut cx, &mut buf) {
            Poll::Pending => true,
            Poll::Ready(Ok(_)) => false,
            Poll::Ready(Err(e)) => e.kind() == io::ErrorKind::WouldBlock,
        }
    }
}

/// Default connector: TCP, TLS for `https` routes, optional proxy tunnel
pub struct HttpConnector {
    tls: TlsConnector,
    policy: TlsPolicy,
    proxy: Option<ProxyCredentials>,
}

impl HttpConnector {
    /// Build the connector from the TLS and proxy settings of `config`
    ///
    /// Fails with `Config` when trust material cannot be loaded.
    pub fn new(config: &PoolConfig) -> PoolResult<Self> {
        let client_config = tls::client_config(config)?;
        Ok(Self {
            tls: TlsConnector::from(client_config),
            policy: TlsPolicy::from_config(config),
            proxy: config.proxy.clone(),
        })
    }

    pub fn tls_policy(&self) -> TlsPolicy {
        self.policy
    }

    pub fn proxy(&self) -> Option<&ProxyCredentials> {
        self.proxy.as_ref()
    }

    async fn open_tcp(&self, route: &Route) -> io::Result<TcpStream> {
        let stream = match &self.proxy {
            Some(proxy) => {
                trace!(%route, proxy = %proxy.host, "connecting through proxy");
                let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port)).await?;
                if route.scheme().is_secure() {
                    tunnel(&mut stream, route, proxy).await?;
                }
                stream
            }
            None => TcpStream::connect((route.host(), route.port())).await?,
        };
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[async_trait]
impl Connector for HttpConnector {
    type Connection = HttpStream;

    async fn connect(&self, route: &Route) -> io::Result<HttpStream> {
        let tcp = self.open_tcp(route).await?;

        match route.scheme() {
            Scheme::Http => Ok(HttpStream::Plain(tcp)),
            Scheme::Https => {
                let server_name = ServerName::try_from(route.host().to_owned())
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                let stream = self.tls.connect(server_name, tcp).await?;
                debug!(%route, policy = %self.policy, "TLS handshake complete");
                Ok(HttpStream::Tls(Box::new(stream)))
            }
        }
    }
}

/// Ask the proxy to open a tunnel to `route` with an HTTP CONNECT
async fn tunnel(stream: &mut TcpStream, route: &Route, proxy: &ProxyCredentials) -> io::Result<()> {
    let authority = route.authority();
    let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some(auth) = proxy.authorization() {
        request.push_str(&format!("Proxy-Authorization: {auth}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::with_capacity(256);
    let mut chunk = [0u8; 256];
    while !response.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "proxy closed the connection during CONNECT",
            ));
        }
        response.extend_from_slice(&chunk[..n]);
        if response.len() > MAX_CONNECT_RESPONSE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "oversized CONNECT response"));
        }
    }

    let status_line = response
        .split(|b| *b == b'\n')
        .next()
        .map(|line| String::from_utf8_lossy(line).trim().to_string())
        .unwrap_or_default();
    let status = status_line.split_whitespace().nth(1).unwrap_or_default();

    match status {
        "200" => Ok(()),
        "407" => Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("proxy authentication required: {status_line}"),
        )),
        _ => Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("proxy refused tunnel to {authority}: {status_line}"),
        )),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Script {
        next_serial: AtomicU64,
        opened: AtomicUsize,
        closed: Arc<AtomicUsize>,
        fail_close: Mutex<HashSet<u64>>,
        fail_next_connect: AtomicBool,
        /// Bumped to make every connection opened so far look closed by the peer
        hang_ups: Arc<AtomicU64>,
    }

    /// In-memory connector with scripted failures
    #[derive(Clone, Default)]
    pub(crate) struct ScriptedConnector {
        script: Arc<Script>,
    }

    impl ScriptedConnector {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn opened(&self) -> usize {
            self.script.opened.load(Ordering::SeqCst)
        }

        /// Connections closed without error
        pub fn closed(&self) -> usize {
            self.script.closed.load(Ordering::SeqCst)
        }

        /// Make the connections with these serials (1-based, in open order) fail to close
        pub fn fail_close_on(&self, serials: &[u64]) {
            self.script.fail_close.lock().extend(serials.iter().copied());
        }

        pub fn fail_next_connect(&self) {
            self.script.fail_next_connect.store(true, Ordering::SeqCst);
        }

        /// Simulate the peer closing every connection opened so far
        pub fn hang_up_all(&self) {
            self.script.hang_ups.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) struct ScriptedConnection {
        pub serial: u64,
        open: bool,
        fail_close: bool,
        closed: Arc<AtomicUsize>,
        hang_ups: Arc<AtomicU64>,
        hang_ups_at_open: u64,
    }

    impl ScriptedConnection {
        pub fn mark_broken(&mut self) {
            self.open = false;
        }
    }

    #[async_trait]
    impl Connection for ScriptedConnection {
        async fn close(&mut self) -> io::Result<()> {
            if self.fail_close {
                return Err(io::Error::other("scripted close failure"));
            }
            self.open = false;
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open && self.hang_ups.load(Ordering::SeqCst) == self.hang_ups_at_open
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        type Connection = ScriptedConnection;

        async fn connect(&self, _route: &Route) -> io::Result<ScriptedConnection> {
            if self.script.fail_next_connect.swap(false, Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "scripted refusal"));
            }
            let serial = self.script.next_serial.fetch_add(1, Ordering::SeqCst) + 1;
            self.script.opened.fetch_add(1, Ordering::SeqCst);
            Ok(ScriptedConnection {
                serial,
                open: true,
                fail_close: self.script.fail_close.lock().contains(&serial),
                closed: Arc::clone(&self.script.closed),
                hang_ups: Arc::clone(&self.script.hang_ups),
                hang_ups_at_open: self.script.hang_ups.load(Ordering::SeqCst),
            })
        }
    }
}
