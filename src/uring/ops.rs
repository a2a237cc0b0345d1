use super::ring::Ring;
use super::types::Opcode;
use crate::context::Context;
use crate::errors::{Error, Result};
use crate::poll::Interest;
use nix::sys::socket::{SockaddrLike, SockaddrStorage};
use std::any::Any;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::RawFd;

// Keeps the marshalling structures of a sendmsg/recvmsg alive until its
// completion: the kernel reads the msghdr, iovec array, address, and
// control bytes from user memory at execution time, not at submit time.
struct MsgHold {
    _msg: Box<libc::msghdr>,
    _iovecs: Box<[libc::iovec]>,
    _name: Option<Box<SockaddrStorage>>,
    _from: Option<Box<libc::sockaddr_storage>>,
    _oob: Option<Box<[u8]>>,
}

// Safety: the held pointers are only dereferenced by the kernel.
unsafe impl Send for MsgHold {}

// Keeps a vectored-I/O iovec array alive until its completion is observed.
struct IovecsHold(Box<[libc::iovec]>);

// Safety: the held pointers are only dereferenced by the kernel.
unsafe impl Send for IovecsHold {}

fn iovecs_from_mut(bufs: &mut [IoSliceMut<'_>]) -> Box<[libc::iovec]> {
    bufs.iter_mut()
        .map(|buf| libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        })
        .collect()
}

fn iovecs_from(bufs: &[IoSlice<'_>]) -> Box<[libc::iovec]> {
    bufs.iter()
        .map(|buf| libc::iovec {
            iov_base: buf.as_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        })
        .collect()
}

/// Submission API.
///
/// The `unsafe` operations reference caller memory from the SQE; that
/// memory must stay valid and untouched until the operation's completion
/// has been observed through [`Ring::next_completion`] (including the
/// trailing notification CQE of zero-copy sends).
impl Ring {
    /// Carries a context through a completion as a fence.
    pub fn nop(&self, ctx: Context, fd: RawFd) -> Result<()> {
        self.submit_op(Opcode::Nop, ctx.with_fd(fd), fd, 0, 0, 0, 0, None)
    }

    /// Vectored read.
    ///
    /// # Safety
    /// The buffers behind `bufs` must outlive the completion.
    pub unsafe fn readv(&self, ctx: Context, fd: RawFd, bufs: &mut [IoSliceMut<'_>]) -> Result<()> {
        if bufs.is_empty() {
            return Err(Error::InvalidParam);
        }
        let iovecs = iovecs_from_mut(bufs);
        let addr = iovecs.as_ptr() as u64;
        let len = iovecs.len() as u32;
        self.submit_op(
            Opcode::Readv,
            ctx.with_fd(fd),
            fd,
            0,
            addr,
            len,
            0,
            Some(Box::new(IovecsHold(iovecs))),
        )
    }

    /// Vectored write.
    ///
    /// # Safety
    /// The buffers behind `bufs` must outlive the completion.
    pub unsafe fn writev(&self, ctx: Context, fd: RawFd, bufs: &[IoSlice<'_>]) -> Result<()> {
        if bufs.is_empty() {
            return Err(Error::InvalidParam);
        }
        let iovecs = iovecs_from(bufs);
        let addr = iovecs.as_ptr() as u64;
        let len = iovecs.len() as u32;
        self.submit_op(
            Opcode::Writev,
            ctx.with_fd(fd),
            fd,
            0,
            addr,
            len,
            0,
            Some(Box::new(IovecsHold(iovecs))),
        )
    }

    pub fn fsync(&self, ctx: Context, fd: RawFd) -> Result<()> {
        self.submit_op(Opcode::Fsync, ctx.with_fd(fd), fd, 0, 0, 0, 0, None)
    }

    /// Scatter/gather send with optional control bytes and destination.
    ///
    /// # Safety
    /// The buffers behind `bufs` must outlive the completion; with
    /// zero-copy the kernel acknowledges them through the trailing
    /// notification CQE flagged [`CqeFlags::NOTIF`](super::CqeFlags::NOTIF).
    pub unsafe fn sendmsg(
        &self,
        ctx: Context,
        fd: RawFd,
        bufs: &[IoSlice<'_>],
        oob: Option<&[u8]>,
        to: Option<SockaddrStorage>,
    ) -> Result<()> {
        if bufs.is_empty() {
            return Err(Error::InvalidParam);
        }
        let iovecs = iovecs_from(bufs);
        let name = to.map(Box::new);
        let oob = oob.map(|oob| oob.to_vec().into_boxed_slice());

        let mut msg: Box<libc::msghdr> = Box::new(unsafe { std::mem::zeroed() });
        if let Some(name) = &name {
            msg.msg_name = name.as_ptr() as *mut libc::c_void;
            msg.msg_namelen = name.len();
        }
        msg.msg_iov = iovecs.as_ptr() as *mut libc::iovec;
        msg.msg_iovlen = iovecs.len();
        if let Some(oob) = &oob {
            msg.msg_control = oob.as_ptr() as *mut libc::c_void;
            msg.msg_controllen = oob.len();
        }

        let addr = &*msg as *const libc::msghdr as u64;
        let hold = MsgHold {
            _msg: msg,
            _iovecs: iovecs,
            _name: name,
            _from: None,
            _oob: oob,
        };
        self.submit_op(
            Opcode::Sendmsg,
            ctx.with_fd(fd),
            fd,
            0,
            addr,
            1,
            libc::MSG_ZEROCOPY as u32,
            Some(Box::new(hold)),
        )
    }

    /// Scatter/gather receive; the source address is captured internally
    /// and the payload lands in `bufs`.
    ///
    /// # Safety
    /// The buffers behind `bufs` and `oob` must outlive the completion.
    pub unsafe fn recvmsg(
        &self,
        ctx: Context,
        fd: RawFd,
        bufs: &mut [IoSliceMut<'_>],
        oob: Option<&mut [u8]>,
    ) -> Result<()> {
        if bufs.is_empty() {
            return Err(Error::InvalidParam);
        }
        let iovecs = iovecs_from_mut(bufs);
        let mut from: Box<libc::sockaddr_storage> = Box::new(unsafe { std::mem::zeroed() });

        let mut msg: Box<libc::msghdr> = Box::new(unsafe { std::mem::zeroed() });
        msg.msg_name = &mut *from as *mut libc::sockaddr_storage as *mut libc::c_void;
        msg.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        msg.msg_iov = iovecs.as_ptr() as *mut libc::iovec;
        msg.msg_iovlen = iovecs.len();
        if let Some(oob) = oob {
            msg.msg_control = oob.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = oob.len();
        }

        let addr = &*msg as *const libc::msghdr as u64;
        let hold = MsgHold {
            _msg: msg,
            _iovecs: iovecs,
            _name: None,
            _from: Some(from),
            _oob: None,
        };
        self.submit_op(
            Opcode::Recvmsg,
            ctx.with_fd(fd),
            fd,
            0,
            addr,
            1,
            libc::MSG_WAITALL as u32,
            Some(Box::new(hold)),
        )
    }

    /// Accepts on a listening socket; the completion result is the new fd,
    /// created nonblocking and close-on-exec.
    pub fn accept(&self, ctx: Context, fd: RawFd) -> Result<()> {
        self.submit_op(
            Opcode::Accept,
            ctx.with_fd(fd),
            fd,
            0,
            0,
            0,
            (libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC) as u32,
            None,
        )
    }

    /// Closes `fd` asynchronously.
    pub fn close(&self, ctx: Context, fd: RawFd) -> Result<()> {
        self.submit_op(Opcode::Close, ctx.with_fd(fd), fd, 0, 0, 0, 0, None)
    }

    /// Reads into a contiguous buffer.
    ///
    /// # Safety
    /// `buf` must outlive the completion.
    pub unsafe fn read(&self, ctx: Context, fd: RawFd, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Err(Error::InvalidParam);
        }
        self.submit_op(
            Opcode::Read,
            ctx.with_fd(fd),
            fd,
            0,
            buf.as_mut_ptr() as u64,
            buf.len() as u32,
            0,
            None,
        )
    }

    /// Writes a contiguous buffer.
    ///
    /// # Safety
    /// `buf` must outlive the completion.
    pub unsafe fn write(&self, ctx: Context, fd: RawFd, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Err(Error::InvalidParam);
        }
        self.submit_op(
            Opcode::Write,
            ctx.with_fd(fd),
            fd,
            0,
            buf.as_ptr() as u64,
            buf.len() as u32,
            0,
            None,
        )
    }

    /// Writes an owned payload. The bytes live in the in-flight table
    /// until the completion is observed, so no caller-side lifetime
    /// contract is needed.
    pub fn write_owned(&self, ctx: Context, fd: RawFd, payload: bytes::Bytes) -> Result<()> {
        if payload.is_empty() {
            return Err(Error::InvalidParam);
        }
        // Bytes data is heap-allocated and address-stable across moves.
        let addr = payload.as_ptr() as u64;
        let len = payload.len() as u32;
        self.submit_op(
            Opcode::Write,
            ctx.with_fd(fd),
            fd,
            0,
            addr,
            len,
            0,
            Some(Box::new(payload)),
        )
    }

    /// Zero-copy socket send.
    ///
    /// # Safety
    /// `buf` must stay untouched until the completion — and its
    /// zero-copy notification CQE — have been observed.
    pub unsafe fn send(&self, ctx: Context, fd: RawFd, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Err(Error::InvalidParam);
        }
        self.submit_op(
            Opcode::Send,
            ctx.with_fd(fd),
            fd,
            0,
            buf.as_ptr() as u64,
            buf.len() as u32,
            libc::MSG_ZEROCOPY as u32,
            None,
        )
    }

    /// Socket receive, waiting for the full buffer where the protocol
    /// allows.
    ///
    /// # Safety
    /// `buf` must outlive the completion.
    pub unsafe fn recv(&self, ctx: Context, fd: RawFd, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Err(Error::InvalidParam);
        }
        self.submit_op(
            Opcode::Recv,
            ctx.with_fd(fd),
            fd,
            0,
            buf.as_mut_ptr() as u64,
            buf.len() as u32,
            libc::MSG_WAITALL as u32,
            None,
        )
    }

    /// Threads an epoll_ctl through the ring: `op` is one of the
    /// EPOLL_CTL_* constants, applied to `fd` on the epoll instance
    /// `epfd`.
    pub fn epoll_ctl(
        &self,
        ctx: Context,
        epfd: RawFd,
        op: i32,
        fd: RawFd,
        interest: Interest,
    ) -> Result<()> {
        let event = Box::new(libc::epoll_event {
            events: interest.bits(),
            u64: fd as u64,
        });
        let addr = &*event as *const libc::epoll_event as u64;
        self.submit_op(
            Opcode::EpollCtl,
            ctx.with_fd(fd),
            epfd,
            fd as u64,
            addr,
            op as u32,
            0,
            Some(Box::new(event)),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn submit_op(
        &self,
        op: Opcode,
        ctx: Context,
        fd: RawFd,
        off: u64,
        addr: u64,
        len: u32,
        op_flags: u32,
        keepalive: Option<Box<dyn Any + Send>>,
    ) -> Result<()> {
        let key = self.inflight.insert(ctx, keepalive)?;
        if let Err(e) = self.submit_raw(op, fd, off, addr, len, op_flags, key as u64) {
            self.inflight.remove(key);
            return Err(e);
        }
        Ok(())
    }
}
