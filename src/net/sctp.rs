use super::addr::{Addr, NetworkKind, SctpAddr};
use super::socket::{accept_once, accept_wait, Socket};
use super::{Conn, Listener, DEFAULT_BACKLOG};
use crate::errors::{Error, Result};
use crate::message::UnderlyingProtocol;
use crate::sync::spin::{Level, SpinWaiter};
use nix::errno::Errno;
use nix::sys::socket::{getsockopt, listen, sockopt, Backlog};
use std::net::IpAddr;
use std::os::fd::{AsFd, FromRawFd, OwnedFd, RawFd};

const SOL_SCTP: libc::c_int = 132;
const SCTP_SOCKOPT_BINDX_ADD: libc::c_int = 100;
const SCTP_SOCKOPT_CONNECTX: libc::c_int = 110;

fn new_sctp_socket(addr: &SctpAddr) -> Result<Socket> {
    let (domain, network) = match addr.ip {
        IpAddr::V4(_) => (libc::AF_INET, NetworkKind::Ipv4),
        IpAddr::V6(_) => (libc::AF_INET6, NetworkKind::Ipv6),
    };
    let fd = Errno::result(unsafe {
        libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::IPPROTO_SCTP,
        )
    })?;
    let sock = Socket::from_owned(unsafe { OwnedFd::from_raw_fd(fd) }, network);
    sock.set_default_options()?;
    Ok(sock)
}

// SCTP's bindx/connectx interface takes packed sockaddr bytes through
// setsockopt so a listener can bind multiple addresses.
fn packed_sockaddr(addr: &SctpAddr) -> Vec<u8> {
    match addr.ip {
        IpAddr::V4(ip) => {
            let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = addr.port.to_be();
            sin.sin_addr.s_addr = u32::from_ne_bytes(ip.octets());
            let bytes = unsafe {
                std::slice::from_raw_parts(
                    &sin as *const libc::sockaddr_in as *const u8,
                    std::mem::size_of::<libc::sockaddr_in>(),
                )
            };
            bytes.to_vec()
        }
        IpAddr::V6(ip) => {
            let mut sin6: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = addr.port.to_be();
            sin6.sin6_addr.s6_addr = ip.octets();
            sin6.sin6_scope_id = addr.zone;
            let bytes = unsafe {
                std::slice::from_raw_parts(
                    &sin6 as *const libc::sockaddr_in6 as *const u8,
                    std::mem::size_of::<libc::sockaddr_in6>(),
                )
            };
            bytes.to_vec()
        }
    }
}

fn sctp_bindx(sock: &Socket, addr: &SctpAddr) -> Result<()> {
    let packed = packed_sockaddr(addr);
    Errno::result(unsafe {
        libc::setsockopt(
            sock.fd(),
            SOL_SCTP,
            SCTP_SOCKOPT_BINDX_ADD,
            packed.as_ptr() as *const libc::c_void,
            packed.len() as libc::socklen_t,
        )
    })?;
    Ok(())
}

fn sctp_connectx(sock: &Socket, addr: &SctpAddr) -> Result<()> {
    let packed = packed_sockaddr(addr);
    let res = Errno::result(unsafe {
        libc::setsockopt(
            sock.fd(),
            SOL_SCTP,
            SCTP_SOCKOPT_CONNECTX,
            packed.as_ptr() as *const libc::c_void,
            packed.len() as libc::socklen_t,
        )
    });
    match res {
        Ok(_) => {}
        Err(Errno::EINPROGRESS) => {}
        Err(e) => return Err(e.into()),
    }
    let mut sw = SpinWaiter::new().level(Level::BlockingIo);
    loop {
        let err = getsockopt(&sock.as_fd(), sockopt::SocketError)?;
        match err {
            0 => {
                if nix::sys::socket::getpeername::<nix::sys::socket::SockaddrStorage>(sock.fd())
                    .is_ok()
                {
                    return Ok(());
                }
                sw.once();
            }
            e if e == libc::EINPROGRESS || e == libc::EALREADY => sw.once(),
            e => return Err(Error::from_errno(e)),
        }
    }
}

/// A listening SCTP socket, bound through `SCTP_SOCKOPT_BINDX_ADD`.
pub struct SctpListener {
    sock: Socket,
    laddr: SctpAddr,
}

pub fn listen_sctp(laddr: &SctpAddr) -> Result<SctpListener> {
    let build = || -> Result<SctpListener> {
        let sock = new_sctp_socket(laddr)?;
        sctp_bindx(&sock, laddr)?;
        listen(&sock, Backlog::new(DEFAULT_BACKLOG)?)?;
        let mut laddr = laddr.clone();
        // Reflect the kernel-chosen port for ephemeral binds.
        if laddr.port == 0 {
            let ss = nix::sys::socket::getsockname::<nix::sys::socket::SockaddrStorage>(sock.fd())?;
            if let Some(sa) = super::addr::socket_addr_from_storage(&ss) {
                laddr.port = sa.port();
            }
        }
        Ok(SctpListener { sock, laddr })
    };
    build().map_err(|e| Error::op("listen", "sctp", e))
}

impl SctpListener {
    pub fn accept(&self) -> Result<SctpConn> {
        let (fd, peer) = accept_wait(self.sock.fd())?;
        Ok(self.wrap_accepted(fd, peer))
    }

    pub fn try_accept(&self) -> Result<SctpConn> {
        let (fd, peer) = accept_once(self.sock.fd())?;
        Ok(self.wrap_accepted(fd, peer))
    }

    fn wrap_accepted(
        &self,
        fd: OwnedFd,
        peer: Option<nix::sys::socket::SockaddrStorage>,
    ) -> SctpConn {
        let raddr = peer
            .as_ref()
            .and_then(super::addr::socket_addr_from_storage)
            .map(SctpAddr::from_addr_port)
            .unwrap_or_else(|| self.laddr.clone());
        SctpConn {
            sock: Socket::from_owned(fd, self.sock.network()),
            laddr: self.laddr.clone(),
            raddr,
        }
    }

    pub fn local_addr(&self) -> &SctpAddr {
        &self.laddr
    }

    pub fn close(self) -> Result<()> {
        self.sock.close()
    }
}

impl Listener for SctpListener {
    fn accept(&self) -> Result<Box<dyn Conn>> {
        Ok(Box::new(SctpListener::accept(self)?))
    }

    fn try_accept(&self) -> Result<Box<dyn Conn>> {
        Ok(Box::new(SctpListener::try_accept(self)?))
    }

    fn addr(&self) -> Addr {
        Addr::Sctp(self.laddr.clone())
    }

    fn fd(&self) -> RawFd {
        self.sock.fd()
    }
}

/// Dials an SCTP association through `SCTP_SOCKOPT_CONNECTX`.
pub fn dial_sctp(laddr: Option<&SctpAddr>, raddr: &SctpAddr) -> Result<SctpConn> {
    let build = || -> Result<SctpConn> {
        let local = laddr.cloned().unwrap_or_else(|| match raddr.ip {
            IpAddr::V4(_) => SctpAddr::loopback_v4(0),
            IpAddr::V6(_) => SctpAddr::loopback_v6(0),
        });
        let sock = new_sctp_socket(&local)?;
        sctp_bindx(&sock, &local)?;
        sctp_connectx(&sock, raddr)?;
        Ok(SctpConn {
            sock,
            laddr: local,
            raddr: raddr.clone(),
        })
    };
    build().map_err(|e| Error::op("dial", "sctp", e))
}

/// A connected SCTP association with sequenced-packet semantics.
pub struct SctpConn {
    sock: Socket,
    laddr: SctpAddr,
    raddr: SctpAddr,
}

impl SctpConn {
    pub fn socket(&self) -> &Socket {
        &self.sock
    }

    pub fn close(self) -> Result<()> {
        self.sock.close()
    }
}

impl Conn for SctpConn {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.sock.read(buf)
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        self.sock.write(buf)
    }

    fn local_addr(&self) -> Addr {
        Addr::Sctp(self.laddr.clone())
    }

    fn remote_addr(&self) -> Addr {
        Addr::Sctp(self.raddr.clone())
    }

    fn underlying_protocol(&self) -> UnderlyingProtocol {
        UnderlyingProtocol::SeqPacket
    }

    fn fd(&self) -> RawFd {
        self.sock.fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SpinWait;

    // SCTP support is a kernel module that many environments do not load;
    // skip rather than fail where the protocol is unavailable.
    fn sctp_available() -> bool {
        let fd = unsafe {
            libc::socket(
                libc::AF_INET,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                libc::IPPROTO_SCTP,
            )
        };
        if fd < 0 {
            eprintln!("skipping: SCTP is not available in this environment");
            return false;
        }
        unsafe { libc::close(fd) };
        true
    }

    #[test]
    fn test_loopback_association() {
        if !sctp_available() {
            return;
        }
        let listener = listen_sctp(&SctpAddr::loopback_v4(0)).unwrap();
        let raddr = listener.local_addr().clone();

        let dialed = dial_sctp(None, &raddr).unwrap();
        let accepted = listener.accept().unwrap();

        assert_eq!(dialed.write(b"sctp message").unwrap(), 12);
        let mut buf = [0u8; 32];
        let mut sw = SpinWait::new();
        let n = loop {
            match accepted.read(&mut buf) {
                Ok(n) => break n,
                Err(Error::TemporarilyUnavailable) => sw.once(),
                Err(e) => panic!("read: {}", e),
            }
        };
        assert_eq!(&buf[..n], b"sctp message");
    }

    #[test]
    fn test_listener_reports_ephemeral_port() {
        if !sctp_available() {
            return;
        }
        let listener = listen_sctp(&SctpAddr::loopback_v4(0)).unwrap();
        assert_ne!(listener.local_addr().port, 0);
    }
}
