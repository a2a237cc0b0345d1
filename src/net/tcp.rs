use super::addr::{
    socket_addr_from_storage, sockaddr_in6_from, sockaddr_in_from, Addr, NetworkKind,
};
use super::socket::{accept_once, accept_wait, connect_wait, Socket};
use super::{Conn, Listener, DEFAULT_BACKLOG};
use crate::errors::{Error, Result};
use crate::message::UnderlyingProtocol;
use nix::sys::socket::{bind, getsockname, listen, Backlog, SockProtocol, SockType, SockaddrStorage};
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;

fn network_of(addr: SocketAddr) -> NetworkKind {
    if addr.is_ipv4() {
        NetworkKind::Ipv4
    } else {
        NetworkKind::Ipv6
    }
}

fn bind_socket(sock: &Socket, addr: SocketAddr) -> Result<()> {
    match addr {
        SocketAddr::V4(v4) => bind(sock.fd(), &sockaddr_in_from(v4))?,
        SocketAddr::V6(v6) => bind(sock.fd(), &sockaddr_in6_from(v6))?,
    }
    Ok(())
}

fn local_socket_addr(sock: &Socket) -> Result<(SockaddrStorage, SocketAddr)> {
    let ss = getsockname::<SockaddrStorage>(sock.fd())?;
    let addr = socket_addr_from_storage(&ss)
        .ok_or_else(|| Error::InvalidAddress("unexpected local address family".into()))?;
    Ok((ss, addr))
}

/// A listening TCP socket.
pub struct TcpListener {
    sock: Socket,
    laddr: SocketAddr,
}

impl TcpListener {
    /// Binds and listens on `laddr`. A zero port picks an ephemeral port,
    /// reflected in [`local_addr`](TcpListener::local_addr).
    pub fn bind(laddr: SocketAddr) -> Result<Self> {
        let build = || -> Result<TcpListener> {
            let mut sock = Socket::new(network_of(laddr), SockType::Stream, Some(SockProtocol::Tcp))?;
            bind_socket(&sock, laddr)?;
            listen(&sock, Backlog::new(DEFAULT_BACKLOG)?)?;
            let (ss, laddr) = local_socket_addr(&sock)?;
            sock.set_local(ss);
            Ok(TcpListener { sock, laddr })
        };
        build().map_err(|e| Error::op("listen", "tcp", e))
    }

    /// Accepts one connection, spinning past transient unavailability.
    pub fn accept(&self) -> Result<TcpConn> {
        let (fd, peer) = accept_wait(self.sock.fd())?;
        self.wrap_accepted(fd, peer)
    }

    /// One nonblocking accept attempt.
    pub fn try_accept(&self) -> Result<TcpConn> {
        let (fd, peer) = accept_once(self.sock.fd())?;
        self.wrap_accepted(fd, peer)
    }

    fn wrap_accepted(
        &self,
        fd: std::os::fd::OwnedFd,
        peer: Option<SockaddrStorage>,
    ) -> Result<TcpConn> {
        let sock = Socket::from_owned(fd, self.sock.network());
        sock.request_zerocopy();
        let raddr = peer
            .as_ref()
            .and_then(socket_addr_from_storage)
            .ok_or_else(|| Error::InvalidAddress("unexpected peer address family".into()))?;
        Ok(TcpConn {
            sock,
            laddr: self.laddr,
            raddr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.laddr
    }

    pub fn close(self) -> Result<()> {
        self.sock.close()
    }
}

impl Listener for TcpListener {
    fn accept(&self) -> Result<Box<dyn Conn>> {
        Ok(Box::new(TcpListener::accept(self)?))
    }

    fn try_accept(&self) -> Result<Box<dyn Conn>> {
        Ok(Box::new(TcpListener::try_accept(self)?))
    }

    fn addr(&self) -> Addr {
        Addr::Tcp(self.laddr)
    }

    fn fd(&self) -> RawFd {
        self.sock.fd()
    }
}

/// Dials a TCP connection, optionally binding `laddr` first.
pub fn dial_tcp(laddr: Option<SocketAddr>, raddr: SocketAddr) -> Result<TcpConn> {
    let build = || -> Result<TcpConn> {
        let mut sock = Socket::new(network_of(raddr), SockType::Stream, Some(SockProtocol::Tcp))?;
        if let Some(laddr) = laddr {
            bind_socket(&sock, laddr)?;
        }
        match raddr {
            SocketAddr::V4(v4) => connect_wait(&sock, &sockaddr_in_from(v4))?,
            SocketAddr::V6(v6) => connect_wait(&sock, &sockaddr_in6_from(v6))?,
        }
        let (ss, local) = local_socket_addr(&sock)?;
        sock.set_local(ss);
        Ok(TcpConn {
            sock,
            laddr: local,
            raddr,
        })
    };
    build().map_err(|e| Error::op("dial", "tcp", e))
}

/// A connected TCP stream.
pub struct TcpConn {
    sock: Socket,
    laddr: SocketAddr,
    raddr: SocketAddr,
}

impl TcpConn {
    pub fn socket(&self) -> &Socket {
        &self.sock
    }

    pub fn close(self) -> Result<()> {
        self.sock.close()
    }
}

impl Conn for TcpConn {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.sock.read(buf)
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        self.sock.write(buf)
    }

    fn local_addr(&self) -> Addr {
        Addr::Tcp(self.laddr)
    }

    fn remote_addr(&self) -> Addr {
        Addr::Tcp(self.raddr)
    }

    fn underlying_protocol(&self) -> UnderlyingProtocol {
        UnderlyingProtocol::Stream
    }

    fn fd(&self) -> RawFd {
        self.sock.fd()
    }
}

// The framer speaks `std::io`; shared references keep the conn usable by a
// reader and a writer at the same time.
impl io::Read for &TcpConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.sock.read(buf).map_err(io::Error::from)
    }
}

impl io::Write for &TcpConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sock.write(buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Read for TcpConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut (&*self), buf)
    }
}

impl io::Write for TcpConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(&mut (&*self), buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{message_reader, message_writer, MessageOptions};

    #[test]
    fn test_loopback_framed_round_trip() {
        let listener = TcpListener::bind("[::1]:0".parse().unwrap()).unwrap();
        let dialed = dial_tcp(None, listener.local_addr()).unwrap();
        let accepted = listener.accept().unwrap();

        let writer = message_writer(&dialed, MessageOptions::tcp_socket());
        let reader = message_reader(&accepted, MessageOptions::tcp_socket());

        let payload = b"test0123456789";
        assert_eq!(writer.write(payload).unwrap(), payload.len());

        let mut buf = [0u8; 64];
        let n = reader.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], payload);
    }

    #[test]
    fn test_ipv4_loopback_raw_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let dialed = dial_tcp(None, listener.local_addr()).unwrap();
        let accepted = listener.accept().unwrap();

        assert_eq!(dialed.write(b"ping").unwrap(), 4);
        let mut buf = [0u8; 8];
        // The conn is nonblocking; data may still be in flight.
        let mut sw = crate::sync::SpinWaiter::new().level(crate::sync::Level::Consume);
        let n = loop {
            match accepted.read(&mut buf) {
                Ok(n) => break n,
                Err(Error::TemporarilyUnavailable) => sw.once(),
                Err(e) => panic!("read: {}", e),
            }
        };
        assert_eq!(&buf[..n], b"ping");
    }

    #[test]
    fn test_addresses() {
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(listener.local_addr().port(), 0);

        let dialed = dial_tcp(None, listener.local_addr()).unwrap();
        let accepted = listener.accept().unwrap();

        assert_eq!(
            dialed.remote_addr(),
            Addr::Tcp(listener.local_addr())
        );
        match (accepted.remote_addr(), dialed.local_addr()) {
            (Addr::Tcp(peer), Addr::Tcp(local)) => assert_eq!(peer, local),
            other => panic!("unexpected addresses: {:?}", other),
        }
    }

    #[test]
    fn test_deadlines_are_noops() {
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let dialed = dial_tcp(None, listener.local_addr()).unwrap();
        dialed.set_deadline(None).unwrap();
        dialed
            .set_read_deadline(Some(std::time::Instant::now()))
            .unwrap();
        dialed.set_write_deadline(None).unwrap();
    }

    #[test]
    fn test_dial_unreachable_port_fails() {
        // Port 1 on loopback is almost certainly closed; connect must
        // surface a hard error, not spin forever.
        let res = dial_tcp(None, "127.0.0.1:1".parse().unwrap());
        assert!(res.is_err());
    }
}
