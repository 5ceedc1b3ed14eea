//! Hostname-routed TCP connection multiplexer.
//!
//! Many services share one TCP port. Each accepted connection is sniffed for
//! the hostname its client asked for (HTTP `Host` header or TLS SNI) and
//! handed, sniffed bytes included, to the first registered service whose
//! matcher accepts that name. Services can be in-process listeners,
//! redirects to another address, or worker processes that receive the
//! connection as a passed descriptor.

pub mod buffer;
pub mod error;
pub mod handoff;
mod lock;
pub mod matcher;
pub mod proxy;
pub mod sniff;
pub mod worker;

pub use buffer::{BufferPool, PooledBuffer, Prefix};
pub use error::{ControlError, RegistryError, SniffError, TransferError, WorkerError};
pub use handoff::{ControlSocket, UnixCmd, CONTROL_FD_ENV};
pub use matcher::{parse_matcher, HostName, HostNameSuffix, Hosts, MatchService};
pub use proxy::{
    Backend, LocalListener, Network, Port, PortRegistry, PrefixedStream, Redirect, Redirector,
    RegistryConfig, RegistryStats, Status,
};
pub use worker::{ServiceListener, WorkerControl, WorkerListener};
