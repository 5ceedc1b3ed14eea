//! Hostname sniffing.
//!
//! A connection's first byte selects the sniffer: `0x16` is a TLS handshake
//! record and goes to the ClientHello parser, anything else is treated as
//! HTTP and scanned for a `Host` header. Sniffers read into a pooled buffer
//! that already holds the first byte; whatever they read stays in the buffer
//! and must be replayed to the backend before anything else is read from the
//! connection.

mod http;
mod tls;

pub use http::read_http_server_name;
pub use tls::{read_tls_server_name, CONTENT_TYPE_HANDSHAKE};

use tokio::io::AsyncRead;

use crate::buffer::PooledBuffer;
use crate::error::SniffError;

/// Protocol selected by a connection's first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// TLS record, sniffed for SNI.
    Tls,
    /// Anything else, sniffed for a `Host` header.
    Http,
}

impl Protocol {
    pub fn from_first_byte(byte: u8) -> Self {
        if byte == CONTENT_TYPE_HANDSHAKE {
            Self::Tls
        } else {
            Self::Http
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tls => "tls",
            Self::Http => "http",
        }
    }

    /// Run this protocol's sniffer.
    ///
    /// `buf` must already contain the first byte. On success the filled
    /// region of `buf` is exactly the bytes consumed from the stream.
    pub async fn sniff<R>(&self, reader: &mut R, buf: &mut PooledBuffer) -> Result<Sniffed, SniffError>
    where
        R: AsyncRead + Unpin,
    {
        match self {
            Self::Tls => read_tls_server_name(reader, buf).await,
            Self::Http => read_http_server_name(reader, buf).await,
        }
    }
}

/// Outcome of a successful sniff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sniffed {
    /// Bytes consumed from the stream, including the first byte.
    pub consumed: usize,
    /// Hostname as it appeared on the wire.
    pub hostname: String,
}

/// Strip a trailing `:port` the way `SplitHostPort` does.
///
/// `host:80` gives `host`, `[::1]:443` gives `::1`. Anything that does not
/// split cleanly (no port, bare IPv6, empty port) is returned unchanged.
pub fn strip_port(name: &str) -> &str {
    if let Some(rest) = name.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            if let Some(port) = tail.strip_prefix(':') {
                if !host.contains('[') && !port.contains(':') && !port.contains(']') {
                    return host;
                }
            }
        }
        return name;
    }

    match name.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && !host.contains(']') && !port.contains(']') => {
            host
        }
        _ => name,
    }
}
