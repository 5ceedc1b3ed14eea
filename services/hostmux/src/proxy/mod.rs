//! Shared-port listeners and the backends that consume matched connections.
//!
//! ## Architecture
//!
//! ```text
//! Client -> SharedListener -> Sniffer -> first matching Port -> Backend
//!                                                               |
//!                                      Redirector | LocalListener | UnixCmd
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use hostmux::proxy::{LocalListener, PortRegistry, RegistryConfig};
//! use hostmux::matcher::HostName;
//!
//! let registry = PortRegistry::new(RegistryConfig::default());
//! let redirect = registry
//!     .add_redirect(Arc::new(HostName::new("a.example")), 80, "tcp", "10.0.0.2:8080")
//!     .await?;
//! let local = LocalListener::bind(&registry, 80, Arc::new(HostName::new("b.example"))).await?;
//! let conn = local.accept().await?;
//! ```

mod backend;
mod listener;
mod local;
mod redirect;
mod registry;
mod stream;

pub use backend::Backend;
pub use local::LocalListener;
pub use redirect::{Network, Redirect, Redirector, DEFAULT_CONNECT_TIMEOUT};
pub use registry::{
    Port, PortRegistry, RegistryConfig, RegistryStats, Status, DEFAULT_SNIFF_TIMEOUT,
};
pub use stream::PrefixedStream;
