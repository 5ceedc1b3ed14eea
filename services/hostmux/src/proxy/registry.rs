//! Port registry.
//!
//! The registry owns one OS listener per TCP port and lets any number of
//! independently registered services share it. Each registration is a
//! [`Port`]: a matcher and a backend. The shared listener lives exactly as
//! long as at least one `Port` on it is open.
//!
//! Lock order is always registry map first, then a listener's port list.
//! Dispatch only ever takes the port list, and only for reading.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use super::backend::Backend;
use super::listener;
use crate::buffer::{BufferPool, DEFAULT_MAX_IDLE, HTTP_BUFFER_SIZE, TLS_BUFFER_SIZE};
use crate::error::RegistryError;
use crate::lock::{lock, read, write};
use crate::matcher::MatchService;

/// Default deadline for reading a connection's routing key.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_secs(10);

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Address every shared listener binds to.
    pub bind_ip: IpAddr,
    /// Deadline for sniffing; `None` disables it.
    pub sniff_timeout: Option<Duration>,
    /// Capacity of HTTP sniffing buffers, i.e. the header size limit.
    pub http_buffer: usize,
    /// Capacity of TLS sniffing buffers.
    pub tls_buffer: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            sniff_timeout: Some(DEFAULT_SNIFF_TIMEOUT),
            http_buffer: HTTP_BUFFER_SIZE,
            tls_buffer: TLS_BUFFER_SIZE,
        }
    }
}

impl RegistryConfig {
    /// Configuration bound to `bind_ip`, defaults otherwise.
    pub fn new(bind_ip: IpAddr) -> Self {
        Self {
            bind_ip,
            ..Self::default()
        }
    }
}

/// Registry-wide connection counters.
#[derive(Debug, Default)]
pub struct RegistryStats {
    /// Connections accepted on any shared listener.
    pub connections_accepted: AtomicU64,
    /// Connections dropped because sniffing failed or timed out.
    pub sniff_failed: AtomicU64,
    /// Connections dropped because no service matched.
    pub unmatched: AtomicU64,
    /// Connections handed to a backend that completed successfully.
    pub transferred: AtomicU64,
    /// Connections whose backend reported an error.
    pub transfer_failed: AtomicU64,
}

/// Status of a registration, as reported by handles that own ports.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Status {
    /// Ports the owner has registered.
    pub ports: Vec<u16>,
    /// The owner has been closed.
    pub closing: bool,
    /// The backend is still able to take connections.
    pub active: bool,
}

/// Registry of shared listeners, keyed by port.
///
/// Cheap to clone; all clones refer to the same set of listeners.
#[derive(Clone)]
pub struct PortRegistry {
    inner: Arc<RegistryInner>,
}

pub(crate) struct RegistryInner {
    pub(crate) config: RegistryConfig,
    pub(crate) http_pool: BufferPool,
    pub(crate) tls_pool: BufferPool,
    pub(crate) stats: RegistryStats,
    listeners: Mutex<Listeners>,
    next_id: AtomicU64,
}

#[derive(Default)]
struct Listeners {
    live: HashMap<u16, Arc<SharedListener>>,
    /// Listeners whose accept loop has been told to stop but may still hold
    /// the OS socket.
    draining: HashMap<u16, watch::Receiver<bool>>,
}

/// One registration on a shared listener.
pub(crate) struct PortEntry {
    id: u64,
    matcher: Arc<dyn MatchService>,
    backend: Arc<dyn Backend>,
    closed: Arc<AtomicBool>,
}

/// An OS listener shared by every [`Port`] registered on its port number.
pub(crate) struct SharedListener {
    pub(crate) port: u16,
    pub(crate) local_addr: SocketAddr,
    /// Registrations in registration order; first match wins.
    ports: RwLock<Vec<PortEntry>>,
    shutdown: watch::Sender<bool>,
    stopped: watch::Receiver<bool>,
}

impl SharedListener {
    /// The backend of the first registration whose matcher accepts `name`.
    pub(crate) fn find(&self, name: &str) -> Option<Arc<dyn Backend>> {
        read(&self.ports)
            .iter()
            .find(|entry| entry.matcher.match_service(name))
            .map(|entry| Arc::clone(&entry.backend))
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    fn len(&self) -> usize {
        read(&self.ports).len()
    }
}

impl PortRegistry {
    /// Create an empty registry.
    pub fn new(config: RegistryConfig) -> Self {
        let http_pool = BufferPool::new(config.http_buffer, DEFAULT_MAX_IDLE);
        let tls_pool = BufferPool::new(config.tls_buffer, DEFAULT_MAX_IDLE);
        Self {
            inner: Arc::new(RegistryInner {
                config,
                http_pool,
                tls_pool,
                stats: RegistryStats::default(),
                listeners: Mutex::new(Listeners::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> &RegistryStats {
        &self.inner.stats
    }

    /// Ports that currently have a live shared listener, ascending.
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = lock(&self.inner.listeners).live.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// Number of registrations on `port`.
    pub fn registrations(&self, port: u16) -> usize {
        lock(&self.inner.listeners)
            .live
            .get(&port)
            .map_or(0, |shared| shared.len())
    }

    /// Local address of the listener on `port`, if one is live.
    pub fn local_addr(&self, port: u16) -> Option<SocketAddr> {
        lock(&self.inner.listeners)
            .live
            .get(&port)
            .map(|shared| shared.local_addr)
    }

    /// Register `backend` for hostnames accepted by `matcher` on `port`.
    ///
    /// Binds a listener for the port if none is live. If the port's previous
    /// listener is still shutting down, waits for it to let go of the socket
    /// first.
    pub async fn add_port(
        &self,
        port: u16,
        matcher: Arc<dyn MatchService>,
        backend: Arc<dyn Backend>,
    ) -> Result<Port, RegistryError> {
        if port == 0 {
            return Err(RegistryError::InvalidPort);
        }

        loop {
            let mut stopped = {
                let mut listeners = lock(&self.inner.listeners);
                if let Some(shared) = listeners.live.get(&port) {
                    return Ok(self.register(shared, matcher, backend));
                }
                match listeners.draining.get(&port) {
                    Some(rx) if !*rx.borrow() => rx.clone(),
                    _ => {
                        listeners.draining.remove(&port);
                        let shared = self.start_listener(port)?;
                        let registered = self.register(&shared, matcher, backend);
                        listeners.live.insert(port, shared);
                        return Ok(registered);
                    }
                }
            };
            // A dropped sender means the accept loop has already exited.
            let _ = stopped.wait_for(|stopped| *stopped).await;
        }
    }

    fn register(
        &self,
        shared: &Arc<SharedListener>,
        matcher: Arc<dyn MatchService>,
        backend: Arc<dyn Backend>,
    ) -> Port {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let closed = Arc::new(AtomicBool::new(false));
        write(&shared.ports).push(PortEntry {
            id,
            matcher,
            backend: Arc::clone(&backend),
            closed: Arc::clone(&closed),
        });
        info!(port = shared.port, id, "port registered");
        Port {
            id,
            port: shared.port,
            closed,
            backend,
            listener: Arc::clone(shared),
            registry: Arc::clone(&self.inner),
        }
    }

    fn start_listener(&self, port: u16) -> Result<Arc<SharedListener>, RegistryError> {
        let listener = bind(self.inner.config.bind_ip, port)?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| RegistryError::Bind { port, source })?;

        let (shutdown, _) = watch::channel(false);
        let (stopped_tx, stopped) = watch::channel(false);
        let shared = Arc::new(SharedListener {
            port,
            local_addr,
            ports: RwLock::new(Vec::new()),
            shutdown,
            stopped,
        });

        info!(port, bind_addr = %local_addr, "listener bound");
        listener::spawn(
            Arc::clone(&self.inner),
            Arc::clone(&shared),
            listener,
            stopped_tx,
        );
        Ok(shared)
    }
}

impl fmt::Debug for PortRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortRegistry")
            .field("config", &self.inner.config)
            .field("ports", &self.ports())
            .finish()
    }
}

fn bind(ip: IpAddr, port: u16) -> Result<TcpListener, RegistryError> {
    let addr = SocketAddr::new(ip, port);
    let listener = std::net::TcpListener::bind(addr)
        .and_then(|l| {
            l.set_nonblocking(true)?;
            Ok(l)
        })
        .map_err(|source| RegistryError::Bind { port, source })?;
    TcpListener::from_std(listener).map_err(|source| RegistryError::Bind { port, source })
}

impl RegistryInner {
    /// Tear down a listener whose accept loop hit a fatal error.
    ///
    /// Every registration on it is marked closed.
    pub(crate) fn fail_listener(&self, shared: &Arc<SharedListener>) {
        let mut listeners = lock(&self.listeners);
        let entries = std::mem::take(&mut *write(&shared.ports));
        for entry in &entries {
            entry.closed.store(true, Ordering::SeqCst);
        }
        retire(&mut listeners, shared);
    }
}

#[cfg(test)]
impl PortRegistry {
    /// Tear down the listener on `port` as if its accept loop had failed.
    pub(crate) fn fail_port(&self, port: u16) {
        let shared = lock(&self.inner.listeners).live.get(&port).cloned();
        if let Some(shared) = shared {
            self.inner.fail_listener(&shared);
        }
    }
}

/// Remove `shared` from the live map and tell its accept loop to stop.
fn retire(listeners: &mut Listeners, shared: &Arc<SharedListener>) {
    let is_current = listeners
        .live
        .get(&shared.port)
        .is_some_and(|live| Arc::ptr_eq(live, shared));
    if !is_current {
        return;
    }
    listeners.live.remove(&shared.port);
    listeners
        .draining
        .insert(shared.port, shared.stopped.clone());
    shared.shutdown.send_replace(true);
    info!(port = shared.port, "listener closed");
}

/// A service registered on a shared port.
///
/// Dropping a `Port` closes it.
pub struct Port {
    id: u64,
    port: u16,
    closed: Arc<AtomicBool>,
    backend: Arc<dyn Backend>,
    listener: Arc<SharedListener>,
    registry: Arc<RegistryInner>,
}

impl Port {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Address of the shared listener this port is registered on.
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Deregister from the shared listener, closing the listener if this was
    /// its last registration. Calling it again does nothing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut listeners = lock(&self.registry.listeners);
        let empty = {
            let mut ports = write(&self.listener.ports);
            ports.retain(|entry| entry.id != self.id);
            ports.is_empty()
        };
        info!(port = self.port, id = self.id, "port closed");
        if empty {
            retire(&mut listeners, &self.listener);
        }
    }

    pub fn status(&self) -> Status {
        Status {
            ports: vec![self.port],
            closing: self.is_closed(),
            active: self.backend.active(),
        }
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("port", &self.port)
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
