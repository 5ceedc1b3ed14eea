//! The consumer side of a matched connection.

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::buffer::Prefix;
use crate::error::TransferError;

/// Takes ownership of a matched connection.
///
/// `prefix` holds the bytes read while sniffing. They were consumed from
/// `conn` and must reach the eventual reader before anything else read from
/// `conn`. Whatever happens, the backend is responsible for both values
/// once `transfer` is called; dropping them releases the buffer and closes
/// the socket.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn transfer(&self, prefix: Prefix, conn: TcpStream) -> Result<(), TransferError>;

    /// Whether the backend still accepts connections.
    fn active(&self) -> bool {
        true
    }
}
