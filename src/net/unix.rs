use super::addr::{Addr, NetworkKind, UnixSocketAddr};
use super::socket::{accept_once, accept_wait, connect_wait, Socket};
use super::{Conn, Listener, DEFAULT_BACKLOG};
use crate::errors::{Error, Result};
use crate::message::UnderlyingProtocol;
use nix::sys::socket::{bind, listen, socketpair, AddressFamily, Backlog, SockFlag, SockType, UnixAddr};
use std::io;
use std::os::fd::RawFd;
use std::path::Path;

fn sock_type_of(proto: UnderlyingProtocol) -> SockType {
    match proto {
        UnderlyingProtocol::SeqPacket => SockType::SeqPacket,
        _ => SockType::Stream,
    }
}

/// A listening UNIX-domain socket bound to a pathname. The pathname is
/// unlinked when the listener closes.
pub struct UnixListener {
    sock: Socket,
    laddr: UnixSocketAddr,
    proto: UnderlyingProtocol,
}

/// Listens on a pathname with stream semantics.
pub fn listen_unix(path: impl AsRef<Path>) -> Result<UnixListener> {
    listen_unix_proto(path.as_ref(), UnderlyingProtocol::Stream)
}

/// Listens on a pathname with sequenced-packet semantics.
pub fn listen_unixpacket(path: impl AsRef<Path>) -> Result<UnixListener> {
    listen_unix_proto(path.as_ref(), UnderlyingProtocol::SeqPacket)
}

fn listen_unix_proto(path: &Path, proto: UnderlyingProtocol) -> Result<UnixListener> {
    let build = || -> Result<UnixListener> {
        let sock = Socket::new(NetworkKind::Unix, sock_type_of(proto), None)?;
        let addr = UnixAddr::new(path)?;
        bind(sock.fd(), &addr)?;
        listen(&sock, Backlog::new(DEFAULT_BACKLOG)?)?;
        Ok(UnixListener {
            sock,
            laddr: UnixSocketAddr::new(path),
            proto,
        })
    };
    build().map_err(|e| Error::op("listen", "unix", e))
}

impl UnixListener {
    pub fn accept(&self) -> Result<UnixConn> {
        let (fd, _peer) = accept_wait(self.sock.fd())?;
        Ok(self.wrap_accepted(fd))
    }

    pub fn try_accept(&self) -> Result<UnixConn> {
        let (fd, _peer) = accept_once(self.sock.fd())?;
        Ok(self.wrap_accepted(fd))
    }

    fn wrap_accepted(&self, fd: std::os::fd::OwnedFd) -> UnixConn {
        UnixConn {
            sock: Socket::from_owned(fd, NetworkKind::Unix),
            laddr: self.laddr.clone(),
            // Client unix sockets are usually autobound and unnamed.
            raddr: UnixSocketAddr::default(),
            proto: self.proto,
        }
    }

    pub fn local_addr(&self) -> &UnixSocketAddr {
        &self.laddr
    }

    pub fn close(self) -> Result<()> {
        // Drop runs the unlink.
        Ok(())
    }
}

impl Drop for UnixListener {
    fn drop(&mut self) {
        if !self.laddr.path.as_os_str().is_empty() {
            let _ = std::fs::remove_file(&self.laddr.path);
        }
    }
}

impl Listener for UnixListener {
    fn accept(&self) -> Result<Box<dyn Conn>> {
        Ok(Box::new(UnixListener::accept(self)?))
    }

    fn try_accept(&self) -> Result<Box<dyn Conn>> {
        Ok(Box::new(UnixListener::try_accept(self)?))
    }

    fn addr(&self) -> Addr {
        Addr::Unix(self.laddr.clone())
    }

    fn fd(&self) -> RawFd {
        self.sock.fd()
    }
}

/// Dials a pathname with stream semantics.
pub fn dial_unix(path: impl AsRef<Path>) -> Result<UnixConn> {
    dial_unix_proto(path.as_ref(), UnderlyingProtocol::Stream)
}

/// Dials a pathname with sequenced-packet semantics.
pub fn dial_unixpacket(path: impl AsRef<Path>) -> Result<UnixConn> {
    dial_unix_proto(path.as_ref(), UnderlyingProtocol::SeqPacket)
}

fn dial_unix_proto(path: &Path, proto: UnderlyingProtocol) -> Result<UnixConn> {
    let build = || -> Result<UnixConn> {
        let sock = Socket::new(NetworkKind::Unix, sock_type_of(proto), None)?;
        let addr = UnixAddr::new(path)?;
        connect_wait(&sock, &addr)?;
        Ok(UnixConn {
            sock,
            laddr: UnixSocketAddr::default(),
            raddr: UnixSocketAddr::new(path),
            proto,
        })
    };
    build().map_err(|e| Error::op("dial", "unix", e))
}

/// A connected pair of UNIX sockets, for in-process plumbing and tests.
pub fn unix_socket_pair(proto: UnderlyingProtocol) -> Result<(UnixConn, UnixConn)> {
    let (a, b) = socketpair(
        AddressFamily::Unix,
        sock_type_of(proto),
        None,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
    )?;
    let wrap = |fd| UnixConn {
        sock: Socket::from_owned(fd, NetworkKind::Unix),
        laddr: UnixSocketAddr::default(),
        raddr: UnixSocketAddr::default(),
        proto,
    };
    Ok((wrap(a), wrap(b)))
}

/// A connected UNIX-domain socket.
pub struct UnixConn {
    sock: Socket,
    laddr: UnixSocketAddr,
    raddr: UnixSocketAddr,
    proto: UnderlyingProtocol,
}

impl UnixConn {
    pub fn socket(&self) -> &Socket {
        &self.sock
    }

    pub fn close(self) -> Result<()> {
        self.sock.close()
    }
}

impl Conn for UnixConn {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.sock.read(buf)
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        self.sock.write(buf)
    }

    fn local_addr(&self) -> Addr {
        Addr::Unix(self.laddr.clone())
    }

    fn remote_addr(&self) -> Addr {
        Addr::Unix(self.raddr.clone())
    }

    fn underlying_protocol(&self) -> UnderlyingProtocol {
        self.proto
    }

    fn fd(&self) -> RawFd {
        self.sock.fd()
    }
}

impl io::Read for &UnixConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.sock.read(buf).map_err(io::Error::from)
    }
}

impl io::Write for &UnixConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sock.write(buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{message_reader, message_writer, MessageOptions};
    use crate::sync::{Level, SpinWaiter};

    fn temp_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("sockring-{}-{}.sock", tag, std::process::id()))
    }

    fn read_spin(conn: &UnixConn, buf: &mut [u8]) -> usize {
        let mut sw = SpinWaiter::new().level(Level::Consume);
        loop {
            match conn.read(buf) {
                Ok(n) => return n,
                Err(Error::TemporarilyUnavailable) => sw.once(),
                Err(e) => panic!("read: {}", e),
            }
        }
    }

    #[test]
    fn test_socket_pair_round_trip() {
        let (a, b) = unix_socket_pair(UnderlyingProtocol::Stream).unwrap();
        assert_eq!(a.write(b"pair").unwrap(), 4);
        let mut buf = [0u8; 8];
        let n = read_spin(&b, &mut buf);
        assert_eq!(&buf[..n], b"pair");
    }

    #[test]
    fn test_seqpacket_pair_preserves_boundaries() {
        let (a, b) = unix_socket_pair(UnderlyingProtocol::SeqPacket).unwrap();
        a.write(b"one").unwrap();
        a.write(b"two").unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(read_spin(&b, &mut buf), 3);
        assert_eq!(&buf[..3], b"one");
        assert_eq!(read_spin(&b, &mut buf), 3);
        assert_eq!(&buf[..3], b"two");
    }

    #[test]
    fn test_pathname_listener_round_trip() {
        let path = temp_path("stream");
        let _ = std::fs::remove_file(&path);
        let listener = listen_unix(&path).unwrap();

        let dialed = dial_unix(&path).unwrap();
        let accepted = listener.accept().unwrap();

        let writer = message_writer(&dialed, MessageOptions::default());
        let reader = message_reader(&accepted, MessageOptions::default());
        writer.write(b"unix frame").unwrap();
        let mut buf = [0u8; 32];
        let n = reader.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"unix frame");

        assert!(path.exists());
        drop(listener);
        // Pathname listeners unlink their address on close.
        assert!(!path.exists());
    }

    #[test]
    fn test_passsec_enabled() {
        let path = temp_path("passsec");
        let _ = std::fs::remove_file(&path);
        let listener = listen_unix(&path).unwrap();
        let dialed = dial_unix(&path).unwrap();

        let mut val: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let res = unsafe {
            libc::getsockopt(
                dialed.fd(),
                libc::SOL_SOCKET,
                libc::SO_PASSSEC,
                &mut val as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        };
        assert_eq!(res, 0);
        assert_eq!(val, 1);
        drop(listener);
    }

    #[test]
    fn test_framer_passthrough_on_seqpacket() {
        let (a, b) = unix_socket_pair(UnderlyingProtocol::SeqPacket).unwrap();
        let opts = MessageOptions::sctp_socket();
        let writer = message_writer(&a, opts);
        let reader = message_reader(&b, opts);

        writer.write(b"no header here").unwrap();
        let mut buf = [0u8; 32];
        let n = reader.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"no header here");
    }
}
