//! Control socket for the descriptor-handoff protocol.
//!
//! A connected `AF_UNIX`/`SOCK_SEQPACKET` socket pair. Every `sendmsg` is one
//! message and every `recvmsg` returns exactly one, so message boundaries
//! survive without framing.
//!
//! The byte layouts below match the stream-socket form of this protocol, but
//! the socket type does not: a worker that expects a `SOCK_STREAM` control
//! socket, or that writes several messages back to back and relies on the
//! reader to split them, cannot talk to this parent.
//!
//! Messages:
//! - open request (worker to parent): 2 byte little-endian port
//! - open response (parent to worker): the same 2 bytes, or the 2 bytes
//!   followed by UTF-8 error text
//! - close notice (either way): 2 byte port
//! - connection delivery (parent to worker): the sniffed prefix as data plus
//!   one `SCM_RIGHTS` descriptor

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::cmsg_space;
use nix::sys::socket::{
    recvmsg, sendmsg, shutdown, socketpair, AddressFamily, ControlMessage, ControlMessageOwned,
    MsgFlags, Shutdown, SockFlag, SockType,
};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

/// Length of a port message.
pub const PORT_MESSAGE_LEN: usize = 2;

/// Encode a port for the wire.
pub fn encode_port(port: u16) -> [u8; PORT_MESSAGE_LEN] {
    port.to_le_bytes()
}

/// Decode the port at the start of a message.
pub fn decode_port(msg: &[u8]) -> Option<u16> {
    match msg {
        [lo, hi, ..] => Some(u16::from_le_bytes([*lo, *hi])),
        _ => None,
    }
}

/// One received message.
#[derive(Debug)]
pub struct Message {
    /// Bytes of data written into the caller's buffer.
    pub len: usize,
    /// Descriptor carried with the message, if any.
    pub fd: Option<OwnedFd>,
    /// The data or the ancillary part did not fit and was cut short.
    pub truncated: bool,
}

impl Message {
    /// A zero-length read without a descriptor: the peer has gone.
    pub fn is_eof(&self) -> bool {
        self.len == 0 && self.fd.is_none() && !self.truncated
    }
}

/// A raw connected `SOCK_SEQPACKET` pair, both ends close-on-exec.
pub fn socket_pair() -> io::Result<(OwnedFd, OwnedFd)> {
    socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .map_err(io::Error::from)
}

/// An async control socket.
#[derive(Debug)]
pub struct ControlSocket {
    fd: AsyncFd<OwnedFd>,
}

impl ControlSocket {
    /// Wrap a connected socket. Switches it to non-blocking mode.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_fd(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        // SAFETY: the `AsyncFd` takes ownership of `fd`, so the descriptor
        // stays open and `as_raw_fd` returns the same value until it drops.
        let fd = unsafe {
            AsyncFd::register_with_interest(fd, Interest::READABLE | Interest::WRITABLE)
        }?;
        Ok(Self { fd })
    }

    /// A connected pair of control sockets.
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = socket_pair()?;
        Ok((Self::from_fd(a)?, Self::from_fd(b)?))
    }

    /// Send one message, optionally carrying a descriptor.
    ///
    /// The descriptor is duplicated into the receiver; the caller still owns
    /// its copy.
    pub async fn send(&self, data: &[u8], fd: Option<BorrowedFd<'_>>) -> io::Result<()> {
        let fd = fd.map(|fd| fd.as_raw_fd());
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| send_message(inner.as_raw_fd(), data, fd)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Receive one message into `buf`.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<Message> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| recv_message(inner.as_raw_fd(), &mut *buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Shut down both directions. Pending and future receives on either end
    /// see end of stream.
    pub fn shutdown(&self) -> io::Result<()> {
        match shutdown(self.fd.as_raw_fd(), Shutdown::Both) {
            Ok(()) | Err(nix::errno::Errno::ENOTCONN) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl AsRawFd for ControlSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own; no memory is passed.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn send_message(sock: RawFd, data: &[u8], fd: Option<RawFd>) -> io::Result<()> {
    let iov = [IoSlice::new(data)];
    let fds: Vec<RawFd> = fd.into_iter().collect();
    let cmsgs: Vec<ControlMessage<'_>> = if fds.is_empty() {
        Vec::new()
    } else {
        vec![ControlMessage::ScmRights(&fds)]
    };

    let sent = sendmsg::<()>(sock, &iov, &cmsgs, MsgFlags::MSG_NOSIGNAL, None)
        .map_err(io::Error::from)?;
    if sent != data.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "control message only partially sent",
        ));
    }
    Ok(())
}

fn recv_message(sock: RawFd, buf: &mut [u8]) -> io::Result<Message> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg_buf = cmsg_space!([RawFd; 1]);

    let msg = recvmsg::<()>(
        sock,
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )
    .map_err(io::Error::from)?;

    let mut fds = Vec::new();
    for cmsg in msg.cmsgs().map_err(io::Error::from)? {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            // SAFETY: the kernel just installed these descriptors in our
            // table; nothing else refers to them.
            fds.extend(
                received
                    .into_iter()
                    .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }),
            );
        }
    }

    let truncated = msg
        .flags
        .intersects(MsgFlags::MSG_TRUNC | MsgFlags::MSG_CTRUNC);
    let len = msg.bytes;

    // Anything beyond the first descriptor is closed here.
    let fd = fds.into_iter().next();
    Ok(Message { len, fd, truncated })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_port_encoding() {
        assert_eq!(encode_port(0x1f90), [0x90, 0x1f]);
        assert_eq!(decode_port(&[0x90, 0x1f]), Some(8080));
        assert_eq!(decode_port(&[0x50, 0x00, b'x']), Some(80));
        assert_eq!(decode_port(&[0x50]), None);
    }

    #[tokio::test]
    async fn test_messages_keep_boundaries() {
        let (a, b) = ControlSocket::pair().unwrap();
        a.send(&encode_port(80), None).await.unwrap();
        a.send(&encode_port(443), None).await.unwrap();

        let mut buf = [0u8; 16];
        let first = b.recv(&mut buf).await.unwrap();
        assert_eq!(first.len, 2);
        assert_eq!(decode_port(&buf[..first.len]), Some(80));
        let second = b.recv(&mut buf).await.unwrap();
        assert_eq!(second.len, 2);
        assert_eq!(decode_port(&buf[..second.len]), Some(443));
    }

    #[tokio::test]
    async fn test_truncated_message_flagged() {
        let (a, b) = ControlSocket::pair().unwrap();
        a.send(b"0123456789", None).await.unwrap();

        let mut buf = [0u8; 4];
        let msg = b.recv(&mut buf).await.unwrap();
        assert_eq!(msg.len, 4);
        assert!(msg.truncated);
    }

    #[tokio::test]
    async fn test_shutdown_is_eof() {
        let (a, b) = ControlSocket::pair().unwrap();
        a.shutdown().unwrap();
        let mut buf = [0u8; 4];
        assert!(b.recv(&mut buf).await.unwrap().is_eof());
    }

    #[tokio::test]
    async fn test_descriptor_passing() {
        let (a, b) = ControlSocket::pair().unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(tokio::net::TcpStream::connect(addr), listener.accept());
        let mut client = client.unwrap();
        let server: OwnedFd = accepted.unwrap().0.into_std().unwrap().into();

        a.send(b"prefix", Some(server.as_fd())).await.unwrap();
        drop(server);

        let mut buf = [0u8; 16];
        let msg = b.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..msg.len], b"prefix");
        let received = std::net::TcpStream::from(msg.fd.unwrap());
        received.set_nonblocking(true).unwrap();
        let mut received = tokio::net::TcpStream::from_std(received).unwrap();

        client.write_all(b"live").await.unwrap();
        let mut got = [0u8; 4];
        received.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"live");
    }
}
