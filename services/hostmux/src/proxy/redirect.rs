//! Raw TCP redirects.
//!
//! A redirect forwards every matched connection to one fixed destination:
//! dial, replay the sniffed prefix, then copy bytes both ways until either
//! side is done, at which point both are closed.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::backend::Backend;
use super::registry::{Port, PortRegistry, Status};
use crate::buffer::Prefix;
use crate::error::{RegistryError, TransferError};
use crate::matcher::MatchService;

/// Default connect timeout for redirect destinations.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

const COPY_BUFFER_SIZE: usize = 8192;

/// Address family a redirect destination is resolved in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    /// Either family; the first resolved address wins.
    Tcp,
    Tcp4,
    Tcp6,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Tcp4 => "tcp4",
            Self::Tcp6 => "tcp6",
        }
    }

    fn accepts(&self, addr: &SocketAddr) -> bool {
        match self {
            Self::Tcp => true,
            Self::Tcp4 => addr.is_ipv4(),
            Self::Tcp6 => addr.is_ipv6(),
        }
    }

    /// Resolve `address` (`host:port`) once, keeping the first address of
    /// this family.
    pub async fn resolve(&self, address: &str) -> Result<SocketAddr, RegistryError> {
        let resolve_err = |reason: String| RegistryError::Resolve {
            address: address.to_string(),
            reason,
        };
        let mut addrs = tokio::net::lookup_host(address)
            .await
            .map_err(|e| resolve_err(e.to_string()))?;
        addrs
            .find(|addr| self.accepts(addr))
            .ok_or_else(|| resolve_err(format!("no {} address", self.as_str())))
    }
}

impl FromStr for Network {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "tcp4" => Ok(Self::Tcp4),
            "tcp6" => Ok(Self::Tcp6),
            other => Err(RegistryError::UnsupportedNetwork(other.to_string())),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend that dials a fixed destination for every connection.
#[derive(Debug)]
pub struct Redirector {
    destination: SocketAddr,
    connect_timeout: Duration,
    closed: AtomicBool,
    in_flight: AtomicUsize,
    bytes_to_destination: AtomicU64,
    bytes_from_destination: AtomicU64,
}

impl Redirector {
    pub fn new(destination: SocketAddr) -> Self {
        Self::with_timeout(destination, DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_timeout(destination: SocketAddr, connect_timeout: Duration) -> Self {
        Self {
            destination,
            connect_timeout,
            closed: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            bytes_to_destination: AtomicU64::new(0),
            bytes_from_destination: AtomicU64::new(0),
        }
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    /// Connections currently being forwarded.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Total bytes forwarded (to destination, from destination).
    pub fn bytes(&self) -> (u64, u64) {
        (
            self.bytes_to_destination.load(Ordering::Relaxed),
            self.bytes_from_destination.load(Ordering::Relaxed),
        )
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    async fn connect(&self) -> Result<TcpStream, TransferError> {
        let connect_err = |source: std::io::Error| TransferError::Connect {
            addr: self.destination,
            source,
        };
        let stream = timeout(self.connect_timeout, TcpStream::connect(self.destination))
            .await
            .map_err(|_| connect_err(std::io::ErrorKind::TimedOut.into()))?
            .map_err(connect_err)?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[async_trait]
impl Backend for Redirector {
    async fn transfer(&self, prefix: Prefix, mut conn: TcpStream) -> Result<(), TransferError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransferError::Closed);
        }
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let _guard = InFlight(&self.in_flight);

        let mut upstream = self.connect().await?;
        upstream.write_all(prefix.filled()).await?;
        let replayed = prefix.len() as u64;
        prefix.release();

        let (to_dest, from_dest) = proxy_bidirectional(&mut conn, &mut upstream).await?;
        let to_dest = to_dest + replayed;
        self.bytes_to_destination
            .fetch_add(to_dest, Ordering::Relaxed);
        self.bytes_from_destination
            .fetch_add(from_dest, Ordering::Relaxed);

        debug!(
            destination = %self.destination,
            bytes_to_destination = to_dest,
            bytes_from_destination = from_dest,
            "redirect finished"
        );
        Ok(())
    }

    fn active(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Copy data both ways between two streams.
///
/// The first direction to reach end of stream or fail ends the whole
/// exchange: both write halves are shut down and the error, if any, is
/// returned. Returns (bytes a to b, bytes b to a).
pub(crate) async fn proxy_bidirectional<A, B>(a: &mut A, b: &mut B) -> std::io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    let mut a_to_b = 0u64;
    let mut b_to_a = 0u64;

    let result = tokio::select! {
        r = copy_counted(&mut a_read, &mut b_write, &mut a_to_b) => r,
        r = copy_counted(&mut b_read, &mut a_write, &mut b_to_a) => r,
    };

    // Best effort; the caller drops both streams right after.
    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;
    result.map(|()| (a_to_b, b_to_a))
}

async fn copy_counted<R, W>(reader: &mut R, writer: &mut W, total: &mut u64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        *total += n as u64;
    }
}

/// A registered redirect.
///
/// Dropping it closes its port.
#[derive(Debug)]
pub struct Redirect {
    port: Port,
    redirector: Arc<Redirector>,
}

impl Redirect {
    pub fn destination(&self) -> SocketAddr {
        self.redirector.destination()
    }

    pub fn port(&self) -> u16 {
        self.port.port()
    }

    pub fn redirector(&self) -> &Arc<Redirector> {
        &self.redirector
    }

    /// Stop taking new connections. In-flight connections are left to
    /// finish.
    pub fn close(&self) {
        self.redirector.close();
        self.port.close();
    }

    pub fn status(&self) -> Status {
        self.port.status()
    }
}

impl PortRegistry {
    /// Forward connections on `port` whose hostname `matcher` accepts to
    /// `address`, resolved once now in `network` (`tcp`, `tcp4` or `tcp6`).
    pub async fn add_redirect(
        &self,
        matcher: Arc<dyn MatchService>,
        port: u16,
        network: &str,
        address: &str,
    ) -> Result<Redirect, RegistryError> {
        let network: Network = network.parse()?;
        let destination = network.resolve(address).await?;
        let redirector = Arc::new(Redirector::new(destination));
        let port = self
            .add_port(port, matcher, Arc::clone(&redirector) as Arc<dyn Backend>)
            .await?;
        Ok(Redirect { port, redirector })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::io::duplex;

    #[rstest]
    #[case("tcp", Network::Tcp)]
    #[case("tcp4", Network::Tcp4)]
    #[case("tcp6", Network::Tcp6)]
    fn test_network_parse(#[case] s: &str, #[case] expected: Network) {
        assert_eq!(s.parse::<Network>().unwrap(), expected);
        assert_eq!(expected.to_string(), s);
    }

    #[test]
    fn test_unsupported_network() {
        let err = "udp".parse::<Network>().unwrap_err();
        assert!(matches!(err, RegistryError::UnsupportedNetwork(n) if n == "udp"));
    }

    #[tokio::test]
    async fn test_resolve_by_family() {
        let v4 = Network::Tcp4.resolve("127.0.0.1:80").await.unwrap();
        assert!(v4.is_ipv4());

        let err = Network::Tcp6.resolve("127.0.0.1:80").await.unwrap_err();
        assert!(matches!(err, RegistryError::Resolve { .. }));

        let err = Network::Tcp.resolve("no-port").await.unwrap_err();
        assert!(matches!(err, RegistryError::Resolve { .. }));
    }

    #[tokio::test]
    async fn test_proxy_bidirectional_client_eof_closes_both() {
        let (mut client, mut a) = duplex(64);
        let (mut b, mut server) = duplex(64);

        let proxy = tokio::spawn(async move { proxy_bidirectional(&mut a, &mut b).await });

        client.write_all(b"request").await.unwrap();
        client.shutdown().await.unwrap();

        let mut got = Vec::new();
        server.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"request");

        // The server never wrote or shut down, yet the client sees the end.
        let mut got = Vec::new();
        client.read_to_end(&mut got).await.unwrap();
        assert!(got.is_empty());

        let (to_b, from_b) = proxy.await.unwrap().unwrap();
        assert_eq!((to_b, from_b), (7, 0));
    }

    #[tokio::test]
    async fn test_proxy_bidirectional_server_eof_closes_both() {
        let (mut client, mut a) = duplex(64);
        let (mut b, mut server) = duplex(64);

        let proxy = tokio::spawn(async move { proxy_bidirectional(&mut a, &mut b).await });

        server.write_all(b"bye").await.unwrap();
        drop(server);

        let mut got = Vec::new();
        client.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"bye");

        let (to_b, from_b) = proxy.await.unwrap().unwrap();
        assert_eq!((to_b, from_b), (0, 3));
    }

    #[tokio::test]
    async fn test_closed_redirector_refuses() {
        let redirector = Redirector::new("127.0.0.1:9".parse().unwrap());
        redirector.close();
        assert!(!redirector.active());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (conn, _) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let err = redirector
            .transfer(Prefix::empty(), conn.unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Closed));
    }
}
