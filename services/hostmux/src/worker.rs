//! Worker side of the descriptor-handoff protocol.
//!
//! A process started by the multiplexer finds its control socket through
//! `HOSTMUX_CONTROL_FD`. [`WorkerControl::listen`] asks the parent for a
//! port; connections the parent matches for it arrive on the returned
//! [`WorkerListener`] with their sniffed bytes replayed first.
//!
//! [`ServiceListener`] lets a program run the same way with or without a
//! parent: it uses the control socket when there is one and binds the port
//! itself otherwise.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::socket::{setsockopt, sockopt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::buffer::{BufferPool, PooledBuffer, TLS_BUFFER_SIZE};
use crate::error::WorkerError;
use crate::handoff::control::{decode_port, encode_port, ControlSocket, PORT_MESSAGE_LEN};
use crate::handoff::CONTROL_FD_ENV;
use crate::lock::lock;
use crate::proxy::PrefixedStream;

/// How long a received connection waits for `accept` before it is dropped.
pub const ACCEPT_DEADLINE: Duration = Duration::from_secs(3 * 60);

const ACCEPT_BACKLOG: usize = 1;
const RECEIVE_BUFFERS_IDLE: usize = 4;

type OpenReply = oneshot::Sender<Result<mpsc::Receiver<PrefixedStream>, WorkerError>>;

#[derive(Default)]
struct WorkerState {
    listening: HashMap<u16, mpsc::Sender<PrefixedStream>>,
    pending: Option<OpenReply>,
    exited: bool,
}

struct WorkerInner {
    control: ControlSocket,
    /// One open request in flight at a time.
    request: tokio::sync::Mutex<()>,
    state: Mutex<WorkerState>,
}

/// A worker's connection to its parent.
#[derive(Clone)]
pub struct WorkerControl {
    inner: Arc<WorkerInner>,
}

impl WorkerControl {
    /// Connect to the control socket named by `HOSTMUX_CONTROL_FD`.
    ///
    /// Returns `Ok(None)` when the variable is not set, i.e. the process was
    /// not started by a multiplexer.
    pub fn from_env() -> Result<Option<Self>, WorkerError> {
        let Ok(value) = std::env::var(CONTROL_FD_ENV) else {
            return Ok(None);
        };
        let fd: RawFd = value
            .trim()
            .parse()
            .map_err(|_| WorkerError::InvalidDescriptor(value.clone()))?;
        if fd < 0 {
            return Err(WorkerError::InvalidDescriptor(value));
        }
        // SAFETY: the parent passed this descriptor to us for exclusive use.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Self::from_fd(fd).map(Some)
    }

    /// Use `fd` as the control socket. Starts the receive loop, so this must
    /// be called from within a tokio runtime.
    pub fn from_fd(fd: OwnedFd) -> Result<Self, WorkerError> {
        Ok(Self::from_socket(ControlSocket::from_fd(fd)?))
    }

    pub fn from_socket(control: ControlSocket) -> Self {
        let inner = Arc::new(WorkerInner {
            control,
            request: tokio::sync::Mutex::new(()),
            state: Mutex::new(WorkerState::default()),
        });
        tokio::spawn(receive_loop(Arc::clone(&inner)));
        Self { inner }
    }

    /// The control socket has failed or been closed by the parent.
    pub fn is_exited(&self) -> bool {
        lock(&self.inner.state).exited
    }

    /// Ask the parent to route connections for `port` to this worker.
    pub async fn listen(&self, port: u16) -> Result<WorkerListener, WorkerError> {
        if port == 0 {
            return Err(WorkerError::InvalidPort);
        }
        let _turn = self.inner.request.lock().await;

        let reply = {
            let mut state = lock(&self.inner.state);
            if state.exited {
                return Err(WorkerError::Exited);
            }
            if state.listening.contains_key(&port) {
                return Err(WorkerError::AlreadyListening);
            }
            let (tx, rx) = oneshot::channel();
            state.pending = Some(tx);
            rx
        };

        if let Err(e) = self.inner.control.send(&encode_port(port), None).await {
            lock(&self.inner.state).pending = None;
            return Err(e.into());
        }

        let conns = reply.await.map_err(|_| WorkerError::Exited)??;
        debug!(port, "listening through parent");
        Ok(WorkerListener {
            port,
            conns: tokio::sync::Mutex::new(conns),
            control: self.clone(),
            closed: AtomicBool::new(false),
        })
    }
}

async fn receive_loop(inner: Arc<WorkerInner>) {
    let pool = BufferPool::new(TLS_BUFFER_SIZE, RECEIVE_BUFFERS_IDLE);

    loop {
        let mut buf = pool.acquire();
        let msg = match inner.control.recv(buf.spare_mut()).await {
            Ok(msg) if msg.is_eof() => break,
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "control socket failed");
                break;
            }
        };
        buf.advance(msg.len);

        if let Some(fd) = msg.fd {
            if msg.truncated {
                warn!(len = msg.len, "dropping connection with truncated prefix");
                continue;
            }
            if let Err(e) = deliver(&inner, fd, buf) {
                debug!(error = %e, "failed to take delivered connection");
            }
            continue;
        }

        let Some(port) = decode_port(buf.filled()) else {
            continue;
        };
        let mut state = lock(&inner.state);
        if msg.len == PORT_MESSAGE_LEN {
            if state.listening.remove(&port).is_some() {
                // Close acknowledged; dropping the sender ends the listener.
                debug!(port, "port closed");
            } else if let Some(reply) = state.pending.take() {
                let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
                state.listening.insert(port, tx);
                let _ = reply.send(Ok(rx));
            }
        } else if let Some(reply) = state.pending.take() {
            let text = String::from_utf8_lossy(&buf.filled()[PORT_MESSAGE_LEN..]).into_owned();
            let _ = reply.send(Err(WorkerError::Rejected(text)));
        }
    }

    let mut state = lock(&inner.state);
    state.exited = true;
    state.listening.clear();
    if let Some(reply) = state.pending.take() {
        let _ = reply.send(Err(WorkerError::Exited));
    }
    info!("control socket closed");
}

/// Route a received descriptor to the listener for its local port.
fn deliver(inner: &WorkerInner, fd: OwnedFd, prefix: PooledBuffer) -> std::io::Result<()> {
    let stream = std::net::TcpStream::from(fd);
    let port = stream.local_addr()?.port();

    let Some(tx) = lock(&inner.state).listening.get(&port).cloned() else {
        debug!(port, "connection for unknown port");
        return Ok(());
    };

    stream.set_nonblocking(true)?;
    if let Err(e) = setsockopt(&stream, sockopt::KeepAlive, &true) {
        debug!(error = %e, "failed to enable keepalive");
    }
    let conn = PrefixedStream::new(prefix, TcpStream::from_std(stream)?);

    tokio::spawn(async move {
        match tokio::time::timeout(ACCEPT_DEADLINE, tx.send(conn)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => debug!(port, "listener closed before accept"),
            Err(_) => debug!(port, "connection not accepted in time"),
        }
    });
    Ok(())
}

/// A port opened through the parent.
pub struct WorkerListener {
    port: u16,
    conns: tokio::sync::Mutex<mpsc::Receiver<PrefixedStream>>,
    control: WorkerControl,
    closed: AtomicBool,
}

impl WorkerListener {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the next connection. Fails with [`WorkerError::Closed`] once
    /// the port is closed or the parent has gone away.
    pub async fn accept(&self) -> Result<PrefixedStream, WorkerError> {
        self.conns
            .lock()
            .await
            .recv()
            .await
            .ok_or(WorkerError::Closed)
    }

    /// Tell the parent to stop routing this port here.
    pub async fn close(&self) -> Result<(), WorkerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(WorkerError::Closed);
        }
        self.control
            .inner
            .control
            .send(&encode_port(self.port), None)
            .await?;
        Ok(())
    }
}

impl Drop for WorkerListener {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let control = self.control.clone();
        let port = self.port;
        handle.spawn(async move {
            let _ = control.inner.control.send(&encode_port(port), None).await;
        });
    }
}

/// A listener that goes through the parent when there is one.
pub enum ServiceListener {
    Handoff(WorkerListener),
    Direct(TcpListener),
}

impl ServiceListener {
    /// Listen on `addr`'s port through `control` if it is live, otherwise
    /// bind `addr` directly.
    pub async fn bind(
        control: Option<&WorkerControl>,
        addr: SocketAddr,
    ) -> Result<Self, WorkerError> {
        match control {
            Some(control) if !control.is_exited() => {
                Ok(Self::Handoff(control.listen(addr.port()).await?))
            }
            _ => Ok(Self::Direct(TcpListener::bind(addr).await?)),
        }
    }

    pub async fn accept(&self) -> Result<PrefixedStream, WorkerError> {
        match self {
            Self::Handoff(listener) => listener.accept().await,
            Self::Direct(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(PrefixedStream::new(PooledBuffer::empty(), stream))
            }
        }
    }

    pub async fn close(&self) -> Result<(), WorkerError> {
        match self {
            Self::Handoff(listener) => listener.close().await,
            Self::Direct(_) => Ok(()),
        }
    }

    pub fn is_handoff(&self) -> bool {
        matches!(self, Self::Handoff(_))
    }
}
