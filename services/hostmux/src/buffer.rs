//! Pooled sniffing buffers.
//!
//! Every accepted connection needs a scratch buffer large enough for one
//! header block. Buffers are recycled through a [`BufferPool`] instead of
//! being allocated per connection, and the bytes a connection wrote are
//! zeroed before the storage is handed to the next one.
//!
//! A [`PooledBuffer`] is an owning guard: it returns to its pool when dropped.
//! The filled part of a buffer is the sniffed prefix of a connection, so the
//! same value doubles as the [`Prefix`] handed to backends.

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::lock::lock;

/// Default HTTP header limit (8 KiB, a common web server limit).
pub const HTTP_BUFFER_SIZE: usize = 8 << 10;

/// One maximal TLS record: 5 byte header plus a 16 bit length.
pub const TLS_BUFFER_SIZE: usize = 5 + 65536;

/// Default number of idle buffers kept per pool.
pub const DEFAULT_MAX_IDLE: usize = 64;

/// The bytes consumed while sniffing a connection.
pub type Prefix = PooledBuffer;

struct PoolInner {
    capacity: usize,
    max_idle: usize,
    idle: Mutex<Vec<Box<[u8]>>>,
}

/// A pool of fixed-capacity byte buffers.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool handing out buffers of `capacity` bytes, keeping at most
    /// `max_idle` released buffers around.
    pub fn new(capacity: usize, max_idle: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                max_idle,
                idle: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Capacity of every buffer from this pool.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of released buffers waiting for reuse.
    pub fn idle(&self) -> usize {
        lock(&self.inner.idle).len()
    }

    /// Take a buffer from the pool, allocating if none is idle.
    pub fn acquire(&self) -> PooledBuffer {
        let storage = lock(&self.inner.idle)
            .pop()
            .unwrap_or_else(|| vec![0u8; self.inner.capacity].into_boxed_slice());

        PooledBuffer {
            storage,
            filled: 0,
            pool: Some(Arc::clone(&self.inner)),
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.inner.capacity)
            .field("idle", &self.idle())
            .finish()
    }
}

/// A buffer on loan from a [`BufferPool`].
///
/// Tracks how much of it has been filled; only the filled region is ever
/// exposed for reading and only that region needs zeroing on release.
pub struct PooledBuffer {
    storage: Box<[u8]>,
    filled: usize,
    pool: Option<Arc<PoolInner>>,
}

impl PooledBuffer {
    /// A buffer that belongs to no pool, holding a copy of `bytes`.
    pub fn detached(bytes: &[u8]) -> Self {
        Self {
            storage: bytes.to_vec().into_boxed_slice(),
            filled: bytes.len(),
            pool: None,
        }
    }

    /// An empty buffer that belongs to no pool.
    pub fn empty() -> Self {
        Self::detached(&[])
    }

    /// Total capacity.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Bytes filled so far.
    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// Unfilled capacity left.
    pub fn remaining(&self) -> usize {
        self.storage.len() - self.filled
    }

    /// The filled region.
    pub fn filled(&self) -> &[u8] {
        &self.storage[..self.filled]
    }

    /// Append one byte. Returns false if the buffer is full.
    pub fn push(&mut self, byte: u8) -> bool {
        if self.filled == self.storage.len() {
            return false;
        }
        self.storage[self.filled] = byte;
        self.filled += 1;
        true
    }

    /// The unfilled region, for callers that fill it themselves and then
    /// call [`advance`](Self::advance).
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.filled..]
    }

    /// Mark `n` more bytes of the spare region as filled.
    pub fn advance(&mut self, n: usize) {
        self.filled = (self.filled + n).min(self.storage.len());
    }

    /// Read once from `reader` into the spare region.
    ///
    /// Returns the number of bytes read; 0 means end of stream, or that the
    /// buffer is already full.
    pub async fn read_from<R>(&mut self, reader: &mut R) -> io::Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        if self.remaining() == 0 {
            return Ok(0);
        }
        let n = reader.read(&mut self.storage[self.filled..]).await?;
        self.filled += n;
        Ok(n)
    }

    /// Read exactly `n` more bytes from `reader`.
    pub async fn read_exact_from<R>(&mut self, reader: &mut R, n: usize) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
    {
        if n > self.remaining() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "read exceeds buffer capacity",
            ));
        }
        let start = self.filled;
        let result = reader.read_exact(&mut self.storage[start..start + n]).await;
        // A failed read_exact may have written part of the range.
        self.filled = start + n;
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                self.clear();
                Err(e)
            }
        }
    }

    /// Zero the filled region and reset the buffer to empty.
    pub fn clear(&mut self) {
        self.storage[..self.filled].fill(0);
        self.filled = 0;
    }

    /// Return the buffer to its pool. Same as dropping it.
    pub fn release(self) {}
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        self.filled()
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("capacity", &self.storage.len())
            .field("filled", &self.filled)
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.clear();
        let Some(pool) = self.pool.take() else {
            return;
        };
        let storage = std::mem::take(&mut self.storage);
        if storage.len() != pool.capacity {
            return;
        }
        let mut idle = lock(&pool.idle);
        if idle.len() < pool.max_idle {
            idle.push(storage);
        }
    }
}
