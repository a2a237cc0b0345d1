use nix::sys::socket::{SockaddrIn, SockaddrIn6, SockaddrStorage};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::path::PathBuf;

/// Address family of a socket, in kernel numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkKind {
    Unix = 1,
    Ipv4 = 2,
    Ipv6 = 10,
}

/// An SCTP endpoint. SCTP has no stdlib address type; this mirrors the
/// TCP/UDP socket addresses with a numeric IPv6 zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SctpAddr {
    pub ip: IpAddr,
    pub port: u16,
    pub zone: u32,
}

impl SctpAddr {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port, zone: 0 }
    }

    pub fn from_addr_port(addr: SocketAddr) -> Self {
        let zone = match addr {
            SocketAddr::V6(v6) => v6.scope_id(),
            SocketAddr::V4(_) => 0,
        };
        Self {
            ip: addr.ip(),
            port: addr.port(),
            zone,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        match self.ip {
            IpAddr::V4(ip) => SocketAddr::V4(SocketAddrV4::new(ip, self.port)),
            IpAddr::V6(ip) => SocketAddr::V6(SocketAddrV6::new(ip, self.port, 0, self.zone)),
        }
    }

    pub const fn loopback_v4(port: u16) -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            zone: 0,
        }
    }

    pub const fn loopback_v6(port: u16) -> Self {
        Self {
            ip: IpAddr::V6(Ipv6Addr::LOCALHOST),
            port,
            zone: 0,
        }
    }
}

impl fmt::Display for SctpAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) if self.zone != 0 => write!(f, "[{}%{}]:{}", ip, self.zone, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

/// A UNIX-domain endpoint bound to a pathname.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UnixSocketAddr {
    pub path: PathBuf,
}

impl UnixSocketAddr {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl fmt::Display for UnixSocketAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// A network endpoint of any supported family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addr {
    Tcp(SocketAddr),
    Udp(SocketAddr),
    Sctp(SctpAddr),
    Unix(UnixSocketAddr),
}

impl Addr {
    pub fn network(&self) -> &'static str {
        match self {
            Addr::Tcp(_) => "tcp",
            Addr::Udp(_) => "udp",
            Addr::Sctp(_) => "sctp",
            Addr::Unix(_) => "unix",
        }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Addr::Tcp(a) | Addr::Udp(a) => write!(f, "{}", a),
            Addr::Sctp(a) => write!(f, "{}", a),
            Addr::Unix(a) => write!(f, "{}", a),
        }
    }
}

pub(crate) fn storage_from_socket_addr(addr: SocketAddr) -> SockaddrStorage {
    match addr {
        SocketAddr::V4(v4) => SockaddrStorage::from(v4),
        SocketAddr::V6(v6) => SockaddrStorage::from(v6),
    }
}

pub(crate) fn socket_addr_from_storage(ss: &SockaddrStorage) -> Option<SocketAddr> {
    if let Some(sin) = ss.as_sockaddr_in() {
        return Some(SocketAddr::V4(SocketAddrV4::new(sin.ip(), sin.port())));
    }
    if let Some(sin6) = ss.as_sockaddr_in6() {
        return Some(SocketAddr::V6(SocketAddrV6::new(
            sin6.ip(),
            sin6.port(),
            sin6.flowinfo(),
            sin6.scope_id(),
        )));
    }
    None
}

pub(crate) fn sockaddr_in_from(addr: SocketAddrV4) -> SockaddrIn {
    SockaddrIn::from(addr)
}

pub(crate) fn sockaddr_in6_from(addr: SocketAddrV6) -> SockaddrIn6 {
    SockaddrIn6::from(addr)
}
