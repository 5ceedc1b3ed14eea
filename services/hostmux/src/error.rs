//! Error types for the multiplexer.
//!
//! Errors are grouped by the layer that produces them. Sniffing errors only
//! ever terminate the offending connection; registry errors are returned to
//! whoever tried to register; transfer and control errors are scoped to one
//! connection or one worker.

use std::io;

use thiserror::Error;

/// Failures while extracting a hostname from the leading bytes of a stream.
#[derive(Debug, Error)]
pub enum SniffError {
    /// Header block too large for the buffer, or the stream ended before the
    /// end of the headers.
    #[error("invalid headers")]
    InvalidHeaders,

    /// Complete header block without a `Host` line.
    #[error("no host header")]
    NoHost,

    /// First record is not a TLS handshake record.
    #[error("not a handshake")]
    NoHandshake,

    /// Handshake message is not a ClientHello.
    #[error("not a client hello")]
    NoClientHello,

    /// A declared length disagrees with the data or the enclosing structure.
    #[error("invalid length: {0}")]
    InvalidLength(&'static str),

    /// ClientHello carried no `server_name` extension.
    #[error("no server name")]
    NoName,

    /// Server name was not valid UTF-8.
    #[error("invalid server name")]
    InvalidName,

    /// Declared record does not fit in the sniffing buffer.
    #[error("record of {needed} bytes exceeds buffer of {capacity} bytes")]
    BufferTooSmall { needed: usize, capacity: usize },

    /// Peer did not send enough bytes before the sniff deadline.
    #[error("sniff timed out")]
    Timeout,

    /// Underlying read failed.
    #[error("error reading headers: {0}")]
    Io(#[from] io::Error),
}

/// Failures registering a port or a redirect.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Port 0 cannot be shared.
    #[error("cannot register on port 0")]
    InvalidPort,

    /// Binding the shared listener failed.
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// The handle being extended has already been closed.
    #[error("listener closed")]
    Closed,

    /// Redirect network is not a TCP family.
    #[error("unsupported network: {0}")]
    UnsupportedNetwork(String),

    /// Redirect destination could not be resolved for the requested family.
    #[error("failed to resolve {address}: {reason}")]
    Resolve { address: String, reason: String },
}

/// Failures handing a matched connection to a backend.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Backend has been closed and no longer takes connections.
    #[error("connection closed")]
    Closed,

    /// Dialing the redirect destination failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    /// I/O on the connection or control socket failed.
    #[error("transfer io error: {0}")]
    Io(#[from] io::Error),
}

/// Failures on the parent side of the descriptor-handoff protocol.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Command has already been closed.
    #[error("closed")]
    Closed,

    /// Creating the control socket or spawning the worker failed.
    #[error("failed to start worker: {0}")]
    Spawn(#[source] io::Error),

    /// I/O on the control socket failed.
    #[error("control socket error: {0}")]
    Io(#[from] io::Error),

    /// Signalling the worker failed.
    #[error("failed to signal worker: {0}")]
    Signal(#[from] nix::Error),
}

/// Failures on the worker side of the descriptor-handoff protocol.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Port must be 0 < port < 2^16.
    #[error("port must be 0 < port < 2^16")]
    InvalidPort,

    /// This worker already has a listener on the port.
    #[error("port already being listened on")]
    AlreadyListening,

    /// Parent refused the port; carries the parent's error text.
    #[error("{0}")]
    Rejected(String),

    /// Control socket is gone; the parent has stopped talking to us.
    #[error("control socket closed")]
    Exited,

    /// Listener has been closed.
    #[error("listener closed")]
    Closed,

    /// Control descriptor variable is not a number.
    #[error("invalid control descriptor: {0}")]
    InvalidDescriptor(String),

    /// I/O on the control socket failed.
    #[error("control socket error: {0}")]
    Io(#[from] io::Error),
}

impl From<WorkerError> for io::Error {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::Io(e) => e,
            WorkerError::Closed | WorkerError::Exited => {
                io::Error::new(io::ErrorKind::NotConnected, err)
            }
            other => io::Error::other(other),
        }
    }
}
