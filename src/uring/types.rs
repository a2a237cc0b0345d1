use crate::errors::{Error, Result};
use bitflags::bitflags;
use static_assertions::const_assert_eq;

// mmap offsets of the three shared regions, from io_uring_setup(2).
pub(crate) const IORING_OFF_SQ_RING: i64 = 0;
pub(crate) const IORING_OFF_CQ_RING: i64 = 0x8000000;
pub(crate) const IORING_OFF_SQES: i64 = 0x10000000;

// io_uring_register(2) opcodes used by this crate.
pub(crate) const IORING_REGISTER_BUFFERS: libc::c_uint = 0;
pub(crate) const IORING_UNREGISTER_BUFFERS: libc::c_uint = 1;
pub(crate) const IORING_REGISTER_EVENTFD_ASYNC: libc::c_uint = 7;

bitflags!(
    /// io_uring_setup(2) flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SetupFlags: u32 {
        /// Busy-poll completions; the caller must drive the CQ with
        /// GETEVENTS enters.
        const IOPOLL = 1 << 0;
        /// A kernel thread polls the SQ; enters are only needed for
        /// wake-ups.
        const SQPOLL = 1 << 1;
        /// Pin the SQPOLL thread to `sq_thread_cpu`.
        const SQ_AFF = 1 << 2;
    }
);

bitflags!(
    /// io_uring_enter(2) flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EnterFlags: u32 {
        const GETEVENTS = 1 << 0;
        const SQ_WAKEUP = 1 << 1;
        const SQ_WAIT = 1 << 2;
        const EXT_ARG = 1 << 3;
        const REGISTERED_RING = 1 << 4;
    }
);

bitflags!(
    /// Per-SQE flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SqeFlags: u8 {
        const FIXED_FILE = 1 << 0;
        const IO_DRAIN = 1 << 1;
        const IO_LINK = 1 << 2;
        const IO_HARDLINK = 1 << 3;
        /// Always issue the operation from async context.
        const ASYNC = 1 << 4;
    }
);

bitflags!(
    /// Kernel-written SQ ring flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SqFlags: u32 {
        /// The SQPOLL thread has gone idle and needs an
        /// `IORING_ENTER_SQ_WAKEUP` enter.
        const NEED_WAKEUP = 1 << 0;
        const CQ_OVERFLOW = 1 << 1;
    }
);

bitflags!(
    /// Request-specific information carried in the CQE flags field.
    /// See the io_uring(7) man page for the complete description.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CqeFlags: u32 {
        /// The upper 16 bits of the flags field carry the buffer ID chosen
        /// for a buffer-select request.
        const BUFFER = 1 << 0;
        /// More completions will follow for this request (multi-shot, or a
        /// zero-copy send whose notification is still pending).
        const MORE = 1 << 1;
        /// The socket still had data left when this request completed.
        const SOCK_NONEMPTY = 1 << 2;
        /// A zero-copy notification CQE: the kernel is done with the
        /// buffers of the originating send.
        const NOTIF = 1 << 3;
    }
);

impl From<u32> for CqeFlags {
    fn from(value: u32) -> Self {
        Self::from_bits_retain(value)
    }
}

/// SQE opcodes in kernel numbering.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Nop = 0,
    Readv,
    Writev,
    Fsync,
    ReadFixed,
    WriteFixed,
    PollAdd,
    PollRemove,
    SyncFileRange,
    Sendmsg,
    Recvmsg,
    Timeout,
    TimeoutRemove,
    Accept,
    AsyncCancel,
    LinkTimeout,
    Connect,
    Fallocate,
    Openat,
    Close,
    FilesUpdate,
    Statx,
    Read,
    Write,
    Fadvise,
    Madvise,
    Send,
    Recv,
    Openat2,
    EpollCtl,
    Splice,
    ProvideBuffers,
    RemoveBuffers,
    Tee,
    Shutdown,
    Renameat,
    Unlinkat,
    Mkdirat,
    Symlinkat,
    Linkat,
}

/// struct io_sqring_offsets.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SqRingOffsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub flags: u32,
    pub dropped: u32,
    pub array: u32,
    pub resv1: u32,
    pub user_addr: u64,
}

/// struct io_cqring_offsets.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct CqRingOffsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub overflow: u32,
    pub cqes: u32,
    pub flags: u32,
    pub resv1: u32,
    pub user_addr: u64,
}

/// struct io_uring_params, filled in by the kernel at setup.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct IoUringParams {
    pub sq_entries: u32,
    pub cq_entries: u32,
    pub flags: u32,
    pub sq_thread_cpu: u32,
    pub sq_thread_idle: u32,
    pub features: u32,
    pub wq_fd: u32,
    pub resv: [u32; 3],
    pub sq_off: SqRingOffsets,
    pub cq_off: CqRingOffsets,
}

/// struct io_uring_sqe: one fixed-size submission record.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Sqe {
    pub opcode: u8,
    pub flags: u8,
    pub ioprio: u16,
    pub fd: i32,
    pub off: u64,
    pub addr: u64,
    pub len: u32,
    pub op_flags: u32,
    pub user_data: u64,
    pub buf_index: u16,
    pub personality: u16,
    pub splice_fd_in: i32,
    pub pad2: [u64; 2],
}

/// struct io_uring_cqe: one completion record.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Cqe {
    user_data: u64,
    res: i32,
    flags: u32,
}

const_assert_eq!(std::mem::size_of::<SqRingOffsets>(), 40);
const_assert_eq!(std::mem::size_of::<CqRingOffsets>(), 40);
const_assert_eq!(std::mem::size_of::<IoUringParams>(), 120);
const_assert_eq!(std::mem::size_of::<Sqe>(), 64);
const_assert_eq!(std::mem::size_of::<Cqe>(), 16);

impl Cqe {
    pub fn user_data(&self) -> u64 {
        self.user_data
    }

    /// The raw kernel result: a byte count when non-negative, a negated
    /// errno otherwise.
    pub fn raw_result(&self) -> i32 {
        self.res
    }

    /// Decodes the result into a byte count or a taxonomy error.
    pub fn result(&self) -> Result<u32> {
        if self.res < 0 {
            Err(Error::from_errno(-self.res))
        } else {
            Ok(self.res as u32)
        }
    }

    pub fn flags(&self) -> CqeFlags {
        CqeFlags::from(self.flags)
    }
}
