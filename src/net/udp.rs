use super::addr::{
    socket_addr_from_storage, sockaddr_in6_from, sockaddr_in_from, storage_from_socket_addr, Addr,
    NetworkKind,
};
use super::socket::Socket;
use super::Conn;
use crate::errors::{Error, Result};
use crate::message::UnderlyingProtocol;
use nix::sys::socket::{
    bind, getsockname, recvfrom, sendto, MsgFlags, SockProtocol, SockType, SockaddrStorage,
};
use std::net::SocketAddr;
use std::os::fd::RawFd;

fn network_of(addr: SocketAddr) -> NetworkKind {
    if addr.is_ipv4() {
        NetworkKind::Ipv4
    } else {
        NetworkKind::Ipv6
    }
}

/// A UDP socket, optionally connected to a fixed peer.
pub struct UdpSocket {
    sock: Socket,
    laddr: SocketAddr,
    raddr: Option<SocketAddr>,
}

/// Binds a UDP socket on `laddr`.
pub fn bind_udp(laddr: SocketAddr) -> Result<UdpSocket> {
    let build = || -> Result<UdpSocket> {
        let mut sock = Socket::new(network_of(laddr), SockType::Datagram, Some(SockProtocol::Udp))?;
        match laddr {
            SocketAddr::V4(v4) => bind(sock.fd(), &sockaddr_in_from(v4))?,
            SocketAddr::V6(v6) => bind(sock.fd(), &sockaddr_in6_from(v6))?,
        }
        let ss = getsockname::<SockaddrStorage>(sock.fd())?;
        let laddr = socket_addr_from_storage(&ss)
            .ok_or_else(|| Error::InvalidAddress("unexpected local address family".into()))?;
        sock.set_local(ss);
        Ok(UdpSocket {
            sock,
            laddr,
            raddr: None,
        })
    };
    build().map_err(|e| Error::op("listen", "udp", e))
}

/// Dials a connected UDP socket, optionally binding `laddr` first.
pub fn dial_udp(laddr: Option<SocketAddr>, raddr: SocketAddr) -> Result<UdpSocket> {
    let build = || -> Result<UdpSocket> {
        let mut sock = Socket::new(network_of(raddr), SockType::Datagram, Some(SockProtocol::Udp))?;
        if let Some(laddr) = laddr {
            match laddr {
                SocketAddr::V4(v4) => bind(sock.fd(), &sockaddr_in_from(v4))?,
                SocketAddr::V6(v6) => bind(sock.fd(), &sockaddr_in6_from(v6))?,
            }
        }
        // Datagram connects only record the peer; no in-progress phase.
        match raddr {
            SocketAddr::V4(v4) => nix::sys::socket::connect(sock.fd(), &sockaddr_in_from(v4))?,
            SocketAddr::V6(v6) => nix::sys::socket::connect(sock.fd(), &sockaddr_in6_from(v6))?,
        }
        let ss = getsockname::<SockaddrStorage>(sock.fd())?;
        let local = socket_addr_from_storage(&ss)
            .ok_or_else(|| Error::InvalidAddress("unexpected local address family".into()))?;
        sock.set_local(ss);
        Ok(UdpSocket {
            sock,
            laddr: local,
            raddr: Some(raddr),
        })
    };
    build().map_err(|e| Error::op("dial", "udp", e))
}

impl UdpSocket {
    pub fn send_to(&self, buf: &[u8], to: SocketAddr) -> Result<usize> {
        let addr = storage_from_socket_addr(to);
        Ok(sendto(self.sock.fd(), buf, &addr, MsgFlags::MSG_NOSIGNAL)?)
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Option<SocketAddr>)> {
        let (n, from) = recvfrom::<SockaddrStorage>(self.sock.fd(), buf)?;
        Ok((n, from.as_ref().and_then(socket_addr_from_storage)))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.laddr
    }

    pub fn socket(&self) -> &Socket {
        &self.sock
    }

    pub fn close(self) -> Result<()> {
        self.sock.close()
    }
}

impl Conn for UdpSocket {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.sock.read(buf)
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        self.sock.write(buf)
    }

    fn local_addr(&self) -> Addr {
        Addr::Udp(self.laddr)
    }

    fn remote_addr(&self) -> Addr {
        Addr::Udp(self.raddr.unwrap_or(self.laddr))
    }

    fn underlying_protocol(&self) -> UnderlyingProtocol {
        UnderlyingProtocol::Dgram
    }

    fn fd(&self) -> RawFd {
        self.sock.fd()
    }
}
