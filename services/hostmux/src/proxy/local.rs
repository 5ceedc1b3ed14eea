//! In-process listeners.
//!
//! A [`LocalListener`] registers itself like any other backend but, instead
//! of forwarding bytes, hands each matched connection to application code
//! calling [`LocalListener::accept`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};

use super::backend::Backend;
use super::registry::{Port, PortRegistry, Status};
use super::stream::PrefixedStream;
use crate::buffer::Prefix;
use crate::error::{RegistryError, TransferError};
use crate::lock::lock;
use crate::matcher::MatchService;

/// Connections waiting for `accept`. Matched connections beyond this block
/// their dispatch task until accepted or closed.
const ACCEPT_BACKLOG: usize = 1;

struct Handoff {
    tx: mpsc::Sender<PrefixedStream>,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl Backend for Handoff {
    async fn transfer(&self, prefix: Prefix, conn: TcpStream) -> Result<(), TransferError> {
        let mut closed = self.closed.clone();
        if *closed.borrow() {
            return Err(TransferError::Closed);
        }
        let stream = PrefixedStream::new(prefix, conn);
        tokio::select! {
            sent = self.tx.send(stream) => sent.map_err(|_| TransferError::Closed),
            _ = async { let _ = closed.wait_for(|closed| *closed).await; } => Err(TransferError::Closed),
        }
    }

    fn active(&self) -> bool {
        !*self.closed.borrow()
    }
}

/// A listener fed by the port registry.
pub struct LocalListener {
    registry: PortRegistry,
    port: u16,
    handoff: Arc<Handoff>,
    rx: Mutex<mpsc::Receiver<PrefixedStream>>,
    closed: watch::Sender<bool>,
    ports: std::sync::Mutex<Vec<Port>>,
}

impl LocalListener {
    /// Register a listener for hostnames accepted by `matcher` on `port`.
    pub async fn bind(
        registry: &PortRegistry,
        port: u16,
        matcher: Arc<dyn MatchService>,
    ) -> Result<Self, RegistryError> {
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let (closed, closed_rx) = watch::channel(false);
        let handoff = Arc::new(Handoff {
            tx,
            closed: closed_rx,
        });
        let registered = registry
            .add_port(port, matcher, Arc::clone(&handoff) as Arc<dyn Backend>)
            .await?;

        Ok(Self {
            registry: registry.clone(),
            port,
            handoff,
            rx: Mutex::new(rx),
            closed,
            ports: std::sync::Mutex::new(vec![registered]),
        })
    }

    /// Also accept connections for hostnames matched by `matcher`.
    pub async fn add_alias(&self, matcher: Arc<dyn MatchService>) -> Result<(), RegistryError> {
        if self.is_closed() {
            return Err(RegistryError::Closed);
        }
        let registered = self
            .registry
            .add_port(
                self.port,
                matcher,
                Arc::clone(&self.handoff) as Arc<dyn Backend>,
            )
            .await?;
        lock(&self.ports).push(registered);
        Ok(())
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the next matched connection.
    ///
    /// Returns [`TransferError::Closed`] once the listener is closed, even
    /// for calls already waiting.
    pub async fn accept(&self) -> Result<PrefixedStream, TransferError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(TransferError::Closed);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            stream = rx.recv() => return stream.ok_or(TransferError::Closed),
            _ = async { let _ = closed.wait_for(|closed| *closed).await; } => {}
        }
        drain(&mut rx);
        Err(TransferError::Closed)
    }

    /// Deregister every matcher, fail pending and future accepts and drop
    /// connections still queued for `accept`.
    pub fn close(&self) {
        self.closed.send_replace(true);
        for port in lock(&self.ports).drain(..) {
            port.close();
        }
        // A waiting accept holds the receiver and drains it when it wakes.
        if let Ok(mut rx) = self.rx.try_lock() {
            drain(&mut rx);
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn status(&self) -> Status {
        let ports = lock(&self.ports);
        Status {
            ports: if ports.is_empty() {
                Vec::new()
            } else {
                vec![self.port]
            },
            closing: self.is_closed(),
            active: self.handoff.active(),
        }
    }
}

fn drain(rx: &mut mpsc::Receiver<PrefixedStream>) {
    rx.close();
    while let Ok(stream) = rx.try_recv() {
        drop(stream);
    }
}

impl Drop for LocalListener {
    fn drop(&mut self) {
        self.close();
    }
}
