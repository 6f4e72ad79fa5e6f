//! SEQPACKET Unix-domain transport with descriptor transfer.
//!
//! The registration protocol runs over `SOCK_SEQPACKET`: the transport
//! preserves message boundaries, so each wire message occupies exactly one
//! datagram with no length prefix, and an attached namespace descriptor
//! (`SCM_RIGHTS`) arrives on the same datagram as the message it belongs to.
//!
//! Tokio has no seqpacket socket type, so sockets are created through `nix`
//! and wrapped into tokio's Unix types for readiness; actual I/O goes
//! through `sendmsg`/`recvmsg` on the raw descriptor inside
//! [`UnixStream::async_io`].

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use nix::sys::socket::{
    self, AddressFamily, Backlog, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag,
    SockType, UnixAddr,
};
use tokio::io::Interest;
use tokio::net::{UnixListener, UnixStream};

/// Listen backlog for the registration socket. One peer is expected; the
/// backlog only absorbs reconnect races.
const LISTEN_BACKLOG: i32 = 16;

/// A listening SEQPACKET endpoint.
pub struct PacketListener {
    inner: UnixListener,
}

impl PacketListener {
    /// Bind a new listening endpoint at `path`.
    ///
    /// The caller is responsible for removing any stale file at the path
    /// first; binding over an existing file fails.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be created or bound, or if no
    /// tokio runtime is active.
    pub fn bind(path: &Path) -> io::Result<Self> {
        let sock = socket::socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(io::Error::from)?;

        let addr = UnixAddr::new(path).map_err(io::Error::from)?;
        socket::bind(sock.as_raw_fd(), &addr).map_err(io::Error::from)?;
        socket::listen(&sock, Backlog::new(LISTEN_BACKLOG).map_err(io::Error::from)?)
            .map_err(io::Error::from)?;

        let inner = UnixListener::from_std(std::os::unix::net::UnixListener::from(sock))?;
        Ok(Self { inner })
    }

    /// Accept the next incoming connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the accept call fails.
    pub async fn accept(&self) -> io::Result<PacketStream> {
        let (stream, _addr) = self.inner.accept().await?;
        Ok(PacketStream { inner: stream })
    }
}

impl std::fmt::Debug for PacketListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketListener").finish_non_exhaustive()
    }
}

/// One connected SEQPACKET stream.
///
/// Every send transmits exactly one datagram; every receive consumes exactly
/// one. A receive returning `0` bytes means the peer closed the connection
/// (the protocol never sends empty datagrams).
pub struct PacketStream {
    inner: UnixStream,
}

impl PacketStream {
    /// Connect to a listening endpoint at `path`.
    ///
    /// This is the peer side of the transport; the shim itself only accepts.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect(path: &Path) -> io::Result<Self> {
        let sock = socket::socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(io::Error::from)?;

        let addr = UnixAddr::new(path).map_err(io::Error::from)?;
        socket::connect(sock.as_raw_fd(), &addr).map_err(io::Error::from)?;

        let std_stream = std::os::unix::net::UnixStream::from(sock);
        std_stream.set_nonblocking(true)?;
        Ok(Self {
            inner: UnixStream::from_std(std_stream)?,
        })
    }

    /// Receive one datagram into `buf`, returning the datagram length.
    ///
    /// Returns `Ok(0)` when the peer has closed the connection.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or if the datagram did not fit into
    /// `buf` (truncated datagrams are never delivered short).
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let fd = self.inner.as_raw_fd();
        self.inner
            .async_io(Interest::READABLE, || {
                let mut iov = [IoSliceMut::new(&mut *buf)];
                let msg = socket::recvmsg::<UnixAddr>(fd, &mut iov, None, MsgFlags::empty())
                    .map_err(io::Error::from)?;
                check_not_truncated(msg.flags)?;
                Ok(msg.bytes)
            })
            .await
    }

    /// Receive one datagram plus any attached descriptor.
    ///
    /// At most one descriptor per datagram is accepted; the protocol never
    /// attaches more. A returned descriptor is owned by the caller and
    /// closed on drop.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure, datagram or ancillary truncation, or
    /// if more than one descriptor arrives.
    pub async fn recv_with_fd(&self, buf: &mut [u8]) -> io::Result<(usize, Option<OwnedFd>)> {
        let fd = self.inner.as_raw_fd();
        self.inner
            .async_io(Interest::READABLE, || {
                let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
                let mut iov = [IoSliceMut::new(&mut *buf)];
                let msg = socket::recvmsg::<UnixAddr>(
                    fd,
                    &mut iov,
                    Some(&mut cmsg_buf),
                    MsgFlags::MSG_CMSG_CLOEXEC,
                )
                .map_err(io::Error::from)?;
                check_not_truncated(msg.flags)?;
                if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "ancillary data truncated",
                    ));
                }

                let mut fds: Vec<OwnedFd> = Vec::new();
                for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                    if let ControlMessageOwned::ScmRights(received) = cmsg {
                        for raw in received {
                            // SAFETY: SCM_RIGHTS transfers ownership of the
                            // descriptor to this process; nothing else holds
                            // it yet.
                            fds.push(unsafe { OwnedFd::from_raw_fd(raw) });
                        }
                    }
                }

                let bytes = msg.bytes;
                match fds.len() {
                    0 => Ok((bytes, None)),
                    1 => Ok((bytes, fds.pop())),
                    // Extra descriptors are closed when `fds` drops.
                    _ => Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "received more than one descriptor",
                    )),
                }
            })
            .await
    }

    /// Send `payload` as one datagram.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or a short send.
    pub async fn send(&self, payload: &[u8]) -> io::Result<()> {
        self.sendmsg_inner(payload, None).await
    }

    /// Send `payload` as one datagram with `fd` attached via `SCM_RIGHTS`.
    ///
    /// The descriptor and the payload are delivered to the peer atomically
    /// on the same receive.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or a short send.
    pub async fn send_with_fd(&self, payload: &[u8], fd: BorrowedFd<'_>) -> io::Result<()> {
        self.sendmsg_inner(payload, Some(fd.as_raw_fd())).await
    }

    async fn sendmsg_inner(&self, payload: &[u8], attach: Option<RawFd>) -> io::Result<()> {
        let fd = self.inner.as_raw_fd();
        let sent = self
            .inner
            .async_io(Interest::WRITABLE, || {
                let iov = [IoSlice::new(payload)];
                let result = match attach {
                    Some(raw) => {
                        let fds = [raw];
                        let cmsgs = [ControlMessage::ScmRights(&fds)];
                        socket::sendmsg::<UnixAddr>(fd, &iov, &cmsgs, MsgFlags::empty(), None)
                    }
                    None => socket::sendmsg::<UnixAddr>(fd, &iov, &[], MsgFlags::empty(), None),
                };
                result.map_err(io::Error::from)
            })
            .await?;

        // SEQPACKET transmits a datagram whole; a short count here means the
        // transport contract is broken.
        if sent != payload.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short datagram send: {sent} of {} bytes", payload.len()),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for PacketStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketStream").finish_non_exhaustive()
    }
}

fn check_not_truncated(flags: MsgFlags) -> io::Result<()> {
    if flags.contains(MsgFlags::MSG_TRUNC) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "datagram exceeds receive buffer",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::{Read, Write};
    use std::os::fd::AsFd;
    use std::path::PathBuf;

    use tempfile::TempDir;

    use super::*;

    fn socket_path(dir: &TempDir) -> PathBuf {
        dir.path().join("test.sock")
    }

    async fn pair(dir: &TempDir) -> (PacketStream, PacketStream) {
        let path = socket_path(dir);
        let listener = PacketListener::bind(&path).unwrap();
        let client = PacketStream::connect(&path);
        let (server, client) = tokio::join!(listener.accept(), client);
        (server.unwrap(), client.unwrap())
    }

    #[tokio::test]
    async fn test_datagram_boundaries_preserved() {
        let tmp = TempDir::new().unwrap();
        let (server, client) = pair(&tmp).await;

        client.send(b"first").await.unwrap();
        client.send(b"second message").await.unwrap();

        let mut buf = [0u8; 64];
        let n = server.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"first");
        let n = server.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"second message");
    }

    #[tokio::test]
    async fn test_recv_zero_on_peer_close() {
        let tmp = TempDir::new().unwrap();
        let (server, client) = pair(&tmp).await;

        drop(client);

        let mut buf = [0u8; 16];
        assert_eq!(server.recv(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_truncated_datagram_rejected() {
        let tmp = TempDir::new().unwrap();
        let (server, client) = pair(&tmp).await;

        client.send(b"this does not fit").await.unwrap();

        let mut buf = [0u8; 4];
        let err = server.recv(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_descriptor_rides_with_datagram() {
        let tmp = TempDir::new().unwrap();
        let (server, client) = pair(&tmp).await;

        let file_path = tmp.path().join("payload.txt");
        let mut file = File::create(&file_path).unwrap();
        file.write_all(b"namespace contents").unwrap();
        drop(file);

        let file = File::open(&file_path).unwrap();
        server.send_with_fd(b"add", file.as_fd()).await.unwrap();
        drop(file);

        let mut buf = [0u8; 16];
        let (n, fd) = client.recv_with_fd(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"add");

        // The received descriptor must be independently usable.
        let mut received = File::from(fd.expect("descriptor attached"));
        let mut contents = String::new();
        received.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "namespace contents");
    }

    #[tokio::test]
    async fn test_recv_with_fd_without_descriptor() {
        let tmp = TempDir::new().unwrap();
        let (server, client) = pair(&tmp).await;

        server.send(b"plain").await.unwrap();

        let mut buf = [0u8; 16];
        let (n, fd) = client.recv_with_fd(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"plain");
        assert!(fd.is_none());
    }

    #[tokio::test]
    async fn test_bind_fails_on_existing_file() {
        let tmp = TempDir::new().unwrap();
        let path = socket_path(&tmp);
        std::fs::write(&path, b"occupied").unwrap();

        assert!(PacketListener::bind(&path).is_err());
    }
}
