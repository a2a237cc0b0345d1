use super::addr::NetworkKind;
use crate::errors::{Error, Result};
use crate::sync::spin::{Level, SpinWaiter};
use nix::errno::Errno;
use nix::sys::socket::{
    accept4, getpeername, getsockopt, setsockopt, socket, sockopt, AddressFamily, SockFlag,
    SockProtocol, SockType, SockaddrLike, SockaddrStorage,
};
use nix::sys::uio::{readv, writev};
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

/// A nonblocking, close-on-exec kernel socket.
///
/// Every socket carries `SO_REUSEADDR` and `SO_REUSEPORT`. Inet sockets
/// additionally request the zero-copy transmit mode (`SO_ZEROCOPY`), and
/// datagram sockets enable `SO_BROADCAST`; unix-domain sockets enable
/// `SO_PASSSEC` so the peer security context arrives as control-message
/// bytes through `recvmsg`. The synchronous write paths do not pass
/// `MSG_ZEROCOPY`, so buffers are reusable as soon as a write returns;
/// zero-copy sends happen on the io_uring path, where the completion
/// stream carries the kernel's notification.
pub struct Socket {
    fd: OwnedFd,
    network: NetworkKind,
    local: Option<SockaddrStorage>,
}

impl Socket {
    pub(crate) fn new(
        network: NetworkKind,
        ty: SockType,
        protocol: Option<SockProtocol>,
    ) -> Result<Self> {
        let family = match network {
            NetworkKind::Ipv4 => AddressFamily::Inet,
            NetworkKind::Ipv6 => AddressFamily::Inet6,
            NetworkKind::Unix => AddressFamily::Unix,
        };
        let fd = socket(
            family,
            ty,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            protocol,
        )?;
        let sock = Self {
            fd,
            network,
            local: None,
        };
        sock.set_default_options()?;
        if ty == SockType::Datagram {
            setsockopt(&sock.fd, sockopt::Broadcast, &true)?;
        }
        Ok(sock)
    }

    /// Wraps an fd produced by accept4 or socketpair, which already carries
    /// the nonblock and cloexec flags.
    pub(crate) fn from_owned(fd: OwnedFd, network: NetworkKind) -> Self {
        Self {
            fd,
            network,
            local: None,
        }
    }

    pub(crate) fn set_default_options(&self) -> Result<()> {
        setsockopt(&self.fd, sockopt::ReuseAddr, &true)?;
        setsockopt(&self.fd, sockopt::ReusePort, &true)?;
        match self.network {
            NetworkKind::Unix => self.set_passsec()?,
            _ => self.request_zerocopy(),
        }
        Ok(())
    }

    // nix has no typed sockopt for SO_PASSSEC; it is a plain boolean flag.
    fn set_passsec(&self) -> Result<()> {
        let one: libc::c_int = 1;
        Errno::result(unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_PASSSEC,
                &one as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        })?;
        Ok(())
    }

    /// Requests the kernel zero-copy transmit mode. Tolerated to fail:
    /// older kernels and non-inet families do not support it.
    pub(crate) fn request_zerocopy(&self) {
        if self.network == NetworkKind::Unix {
            return;
        }
        let one: libc::c_int = 1;
        let res = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_ZEROCOPY,
                &one as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if res != 0 {
            tracing::debug!(fd = self.fd.as_raw_fd(), "SO_ZEROCOPY not supported");
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn network(&self) -> NetworkKind {
        self.network
    }

    pub(crate) fn set_local(&mut self, sa: SockaddrStorage) {
        self.local = Some(sa);
    }

    pub(crate) fn local(&self) -> Option<&SockaddrStorage> {
        self.local.as_ref()
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let n = Errno::result(unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        })?;
        Ok(n as usize)
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let n = Errno::result(unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                libc::MSG_NOSIGNAL,
            )
        })?;
        Ok(n as usize)
    }

    pub fn readv(&self, bufs: &mut [IoSliceMut<'_>]) -> Result<usize> {
        Ok(readv(&self.fd, bufs)?)
    }

    pub fn writev(&self, bufs: &[IoSlice<'_>]) -> Result<usize> {
        Ok(writev(&self.fd, bufs)?)
    }

    /// Scatter/gather send with optional control bytes and destination
    /// address.
    pub fn sendmsg(
        &self,
        bufs: &[IoSlice<'_>],
        oob: Option<&[u8]>,
        to: Option<&SockaddrStorage>,
    ) -> Result<usize> {
        let iovecs = bufs
            .iter()
            .map(|buf| libc::iovec {
                iov_base: buf.as_ptr() as *mut libc::c_void,
                iov_len: buf.len(),
            })
            .collect::<Vec<_>>();
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        if let Some(to) = to {
            msg.msg_name = to.as_ptr() as *mut libc::c_void;
            msg.msg_namelen = to.len();
        }
        msg.msg_iov = iovecs.as_ptr() as *mut libc::iovec;
        msg.msg_iovlen = iovecs.len();
        if let Some(oob) = oob {
            msg.msg_control = oob.as_ptr() as *mut libc::c_void;
            msg.msg_controllen = oob.len();
        }
        let n = Errno::result(unsafe {
            libc::sendmsg(self.fd.as_raw_fd(), &msg, libc::MSG_NOSIGNAL)
        })?;
        Ok(n as usize)
    }

    /// Scatter/gather receive; returns the byte count and the source
    /// address when the protocol carries one.
    pub fn recvmsg(
        &self,
        bufs: &mut [IoSliceMut<'_>],
        oob: Option<&mut [u8]>,
    ) -> Result<(usize, Option<SockaddrStorage>)> {
        let iovecs = bufs
            .iter_mut()
            .map(|buf| libc::iovec {
                iov_base: buf.as_mut_ptr() as *mut libc::c_void,
                iov_len: buf.len(),
            })
            .collect::<Vec<_>>();
        let mut from: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_name = &mut from as *mut libc::sockaddr_storage as *mut libc::c_void;
        msg.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        msg.msg_iov = iovecs.as_ptr() as *mut libc::iovec;
        msg.msg_iovlen = iovecs.len();
        if let Some(oob) = oob {
            msg.msg_control = oob.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = oob.len();
        }
        let n = Errno::result(unsafe { libc::recvmsg(self.fd.as_raw_fd(), &mut msg, 0) })?;
        let from = unsafe {
            SockaddrStorage::from_raw(
                &from as *const libc::sockaddr_storage as *const libc::sockaddr,
                Some(msg.msg_namelen),
            )
        };
        Ok((n as usize, from))
    }

    /// Releases the kernel resources explicitly, reporting any close
    /// error. Dropping the socket closes it silently.
    pub fn close(self) -> Result<()> {
        let fd = self.fd.into_raw_fd();
        Errno::result(unsafe { libc::close(fd) })?;
        Ok(())
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for Socket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// One nonblocking accept attempt on `fd`. Returns the accepted fd
/// (nonblocking, close-on-exec) and the peer address, or
/// [`Error::TemporarilyUnavailable`] when the backlog is empty.
pub(crate) fn accept_once(fd: RawFd) -> Result<(OwnedFd, Option<SockaddrStorage>)> {
    match accept4(fd, SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC) {
        Ok(nfd) => {
            let owned = unsafe { OwnedFd::from_raw_fd(nfd) };
            let peer = getpeername::<SockaddrStorage>(owned.as_raw_fd()).ok();
            Ok((owned, peer))
        }
        Err(e) => Err(e.into()),
    }
}

/// Accepts on `fd`, spinning past transient unavailability at the consume
/// back-off level.
pub(crate) fn accept_wait(fd: RawFd) -> Result<(OwnedFd, Option<SockaddrStorage>)> {
    let mut sw = SpinWaiter::new().level(Level::Consume);
    loop {
        match accept_once(fd) {
            Ok(accepted) => return Ok(accepted),
            Err(Error::TemporarilyUnavailable) => sw.once(),
            Err(e) => return Err(e),
        }
    }
}

/// Issues a connect and, on EINPROGRESS, polls `SO_ERROR` at the
/// blocking-I/O back-off level until the connection is established.
pub(crate) fn connect_wait(sock: &Socket, addr: &dyn SockaddrLike) -> Result<()> {
    match nix::sys::socket::connect(sock.fd(), addr) {
        Ok(()) => return Ok(()),
        Err(Errno::EINPROGRESS) => {}
        Err(e) => return Err(e.into()),
    }
    let mut sw = SpinWaiter::new().level(Level::BlockingIo);
    loop {
        let err = getsockopt(&sock.as_fd(), sockopt::SocketError)?;
        match err {
            0 => {
                // SO_ERROR stays zero while the connect is still pending;
                // the peer name appears once the handshake is done.
                if getpeername::<SockaddrStorage>(sock.fd()).is_ok() {
                    return Ok(());
                }
                sw.once();
            }
            e if e == libc::EINPROGRESS || e == libc::EALREADY => sw.once(),
            e => return Err(Error::from_errno(e)),
        }
    }
}
