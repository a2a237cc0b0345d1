//! Nonblocking sockets, listeners, and connections for TCP, UDP, SCTP and
//! UNIX-domain endpoints.

pub mod addr;
pub use addr::{Addr, NetworkKind, SctpAddr, UnixSocketAddr};

pub mod socket;
pub use socket::Socket;

pub mod tcp;
pub use tcp::{dial_tcp, TcpConn, TcpListener};

pub mod udp;
pub use udp::{bind_udp, dial_udp, UdpSocket};

pub mod unix;
pub use unix::{dial_unix, dial_unixpacket, listen_unix, listen_unixpacket, unix_socket_pair, UnixConn, UnixListener};

pub mod sctp;
pub use sctp::{dial_sctp, listen_sctp, SctpConn, SctpListener};

use crate::errors::Result;
use crate::message::UnderlyingProtocol;
use std::os::fd::RawFd;
use std::time::Instant;

/// A connected socket exposing a stream-or-message I/O surface.
///
/// Deadlines are modeled by caller-held cancellation carried through
/// completion contexts, not by socket timeouts; the deadline setters are
/// no-ops kept for interface compatibility.
pub trait Conn: Send + Sync {
    fn read(&self, buf: &mut [u8]) -> Result<usize>;
    fn write(&self, buf: &[u8]) -> Result<usize>;
    fn local_addr(&self) -> Addr;
    fn remote_addr(&self) -> Addr;
    /// Determines whether a framer over this conn adds length headers.
    fn underlying_protocol(&self) -> UnderlyingProtocol;
    fn fd(&self) -> RawFd;

    fn set_deadline(&self, _deadline: Option<Instant>) -> Result<()> {
        Ok(())
    }

    fn set_read_deadline(&self, _deadline: Option<Instant>) -> Result<()> {
        Ok(())
    }

    fn set_write_deadline(&self, _deadline: Option<Instant>) -> Result<()> {
        Ok(())
    }
}

/// A listening socket producing connections.
pub trait Listener: Send + Sync {
    /// Accepts one connection, spinning past transient unavailability.
    fn accept(&self) -> Result<Box<dyn Conn>>;
    /// One nonblocking accept attempt, for edge-triggered accept loops
    /// that must drain the backlog without spinning.
    fn try_accept(&self) -> Result<Box<dyn Conn>>;
    fn addr(&self) -> Addr;
    fn fd(&self) -> RawFd;
}

pub(crate) const DEFAULT_BACKLOG: i32 = 511;
