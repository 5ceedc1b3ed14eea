//! Accept loop and connection dispatch for shared listeners.
//!
//! Each accepted connection gets its own task: read one byte to pick the
//! sniffer, sniff the hostname into a pooled buffer, find the first matching
//! registration and hand the buffer and the socket to its backend.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, field, info, warn, Instrument, Span};

use super::registry::{RegistryInner, SharedListener};
use crate::buffer::PooledBuffer;
use crate::error::SniffError;
use crate::sniff::{strip_port, Protocol, Sniffed};

/// Back-off after a temporary accept failure.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

pub(crate) fn spawn(
    registry: Arc<RegistryInner>,
    shared: Arc<SharedListener>,
    listener: TcpListener,
    stopped: watch::Sender<bool>,
) {
    let span = tracing::info_span!("listener", port = shared.port);
    tokio::spawn(
        async move {
            run(&registry, &shared, listener).await;
            // The socket is closed by now; let a waiting add_port rebind.
            stopped.send_replace(true);
        }
        .instrument(span),
    );
}

async fn run(registry: &Arc<RegistryInner>, shared: &Arc<SharedListener>, listener: TcpListener) {
    let mut shutdown = shared.shutdown_signal();

    loop {
        tokio::select! {
            // The guard returned by wait_for is not Send; drop it in place.
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                debug!("accept loop stopping");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    registry
                        .stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);

                    let span = tracing::info_span!(
                        "connection",
                        port = shared.port,
                        peer_addr = %peer_addr,
                        hostname = field::Empty,
                    );
                    tokio::spawn(
                        handle_connection(Arc::clone(registry), Arc::clone(shared), stream, peer_addr)
                            .instrument(span),
                    );
                }
                Err(e) if is_temporary(&e) => {
                    warn!(error = %e, "temporary accept error");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
                Err(e) => {
                    error!(error = %e, "accept failed, closing all ports on listener");
                    registry.fail_listener(shared);
                    break;
                }
            }
        }
    }

    drop(listener);
    info!("accept loop stopped");
}

fn is_temporary(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) {
        return true;
    }
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

async fn handle_connection(
    registry: Arc<RegistryInner>,
    shared: Arc<SharedListener>,
    mut stream: TcpStream,
    peer_addr: SocketAddr,
) {
    let sniffed = match registry.config.sniff_timeout {
        Some(limit) => tokio::time::timeout(limit, sniff(&registry, &mut stream))
            .await
            .unwrap_or(Err(SniffError::Timeout)),
        None => sniff(&registry, &mut stream).await,
    };

    let (protocol, sniffed, prefix) = match sniffed {
        Ok(result) => result,
        Err(e) => {
            registry.stats.sniff_failed.fetch_add(1, Ordering::Relaxed);
            debug!(error = %e, "sniff failed, dropping connection");
            return;
        }
    };

    let hostname = strip_port(&sniffed.hostname);
    Span::current().record("hostname", hostname);

    let Some(backend) = shared.find(hostname) else {
        registry.stats.unmatched.fetch_add(1, Ordering::Relaxed);
        debug!(protocol = protocol.as_str(), "no service for host, dropping connection");
        return;
    };

    debug!(
        protocol = protocol.as_str(),
        consumed = sniffed.consumed,
        "dispatching connection"
    );

    match backend.transfer(prefix, stream).await {
        Ok(()) => {
            registry.stats.transferred.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            registry.stats.transfer_failed.fetch_add(1, Ordering::Relaxed);
            debug!(peer_addr = %peer_addr, error = %e, "transfer failed");
        }
    }
}

/// Read the discriminator byte and run the matching sniffer.
async fn sniff(
    registry: &RegistryInner,
    stream: &mut TcpStream,
) -> Result<(Protocol, Sniffed, PooledBuffer), SniffError> {
    let first = stream.read_u8().await?;
    let protocol = Protocol::from_first_byte(first);
    let mut buf = match protocol {
        Protocol::Tls => registry.tls_pool.acquire(),
        Protocol::Http => registry.http_pool.acquire(),
    };
    if !buf.push(first) {
        return Err(SniffError::BufferTooSmall {
            needed: 1,
            capacity: buf.capacity(),
        });
    }
    let sniffed = protocol.sniff(stream, &mut buf).await?;
    Ok((protocol, sniffed, buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temporary_accept_errors() {
        assert!(is_temporary(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_temporary(&io::Error::from_raw_os_error(libc::EMFILE)));
        assert!(!is_temporary(&io::Error::from_raw_os_error(libc::EBADF)));
        assert!(!is_temporary(&io::Error::from(io::ErrorKind::InvalidInput)));
    }
}
