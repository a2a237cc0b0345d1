use super::inflight::InflightTable;
use super::types::{
    Cqe, CqeFlags, EnterFlags, IoUringParams, Opcode, SetupFlags, SqFlags, Sqe,
    IORING_OFF_CQ_RING, IORING_OFF_SQES, IORING_OFF_SQ_RING, IORING_REGISTER_BUFFERS,
    IORING_REGISTER_EVENTFD_ASYNC, IORING_UNREGISTER_BUFFERS,
};
use crate::buffers::AlignedBlock;
use crate::context::Context;
use crate::errors::{Error, Result};
use crate::poll::{Eventfd, Interest, Poller};
use crate::sync::spin::SpinWait;
use nix::errno::Errno;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// Setup knobs for a [`Ring`].
#[derive(Debug, Clone, Copy)]
pub struct RingConfig {
    /// SQE slots; the kernel sizes the CQ at twice this. Power of two.
    pub queue_depth: u32,
    /// Busy-poll completions. The completion reader must then drive the CQ
    /// through [`Ring::poll`].
    pub iopoll: bool,
    /// A kernel thread polls the SQ, removing the enter syscall from the
    /// submission path.
    pub sqpoll: bool,
    /// CPU affinity of the SQPOLL thread.
    pub sq_thread_cpu: u32,
    /// Idle time before the SQPOLL thread parks and requests a wake-up.
    pub sq_thread_idle: Duration,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            queue_depth: 0x2000,
            iopoll: false,
            sqpoll: false,
            sq_thread_cpu: 1,
            sq_thread_idle: Duration::from_secs(5),
        }
    }
}

impl RingConfig {
    #[must_use]
    pub fn queue_depth(mut self, depth: u32) -> Self {
        self.queue_depth = depth;
        self
    }

    #[must_use]
    pub fn iopoll(mut self) -> Self {
        self.iopoll = true;
        self
    }

    #[must_use]
    pub fn sqpoll(mut self) -> Self {
        self.sqpoll = true;
        self
    }
}

/// A shared memory region mapped from the ring fd. Owns the mapping; the
/// typed views below borrow interior pointers from it.
#[derive(Debug)]
struct Mapping {
    ptr: NonNull<libc::c_void>,
    len: NonZeroUsize,
}

unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    fn map(fd: BorrowedFd<'_>, len: usize, offset: i64) -> Result<Self> {
        let len = NonZeroUsize::new(len).ok_or(Error::InvalidParam)?;
        let ptr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED | MapFlags::MAP_POPULATE,
                fd,
                offset,
            )?
        };
        Ok(Self { ptr, len })
    }

    /// Typed pointer at byte `offset`, bounds-checked against the mapping.
    fn offset_as<T>(&self, offset: u32) -> NonNull<T> {
        let end = offset as usize + std::mem::size_of::<T>();
        assert!(end <= self.len.get(), "ring offset outside mapped region");
        unsafe {
            NonNull::new_unchecked(self.ptr.as_ptr().cast::<u8>().add(offset as usize).cast())
        }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        let res = unsafe { munmap(self.ptr, self.len.get()) };
        debug_assert!(res.is_ok(), "munmap failed");
    }
}

/// Typed view over the mapped SQ ring and SQE array. The kernel writes the
/// head; only user space writes the tail.
#[derive(Debug)]
struct Sq {
    head: NonNull<AtomicU32>,
    tail: NonNull<AtomicU32>,
    flags: NonNull<AtomicU32>,
    dropped: NonNull<AtomicU32>,
    array: NonNull<u32>,
    sqe_base: NonNull<Sqe>,
    mask: u32,
    entries: u32,
    _ring: Mapping,
    _sqes: Mapping,
}

impl Sq {
    fn head(&self) -> u32 {
        unsafe { self.head.as_ref() }.load(Ordering::Acquire)
    }

    fn tail(&self) -> u32 {
        unsafe { self.tail.as_ref() }.load(Ordering::Acquire)
    }

    fn publish_tail(&self, tail: u32) {
        unsafe { self.tail.as_ref() }.store(tail, Ordering::Release);
    }

    fn flags(&self) -> SqFlags {
        SqFlags::from_bits_retain(unsafe { self.flags.as_ref() }.load(Ordering::Acquire))
    }

    #[allow(dead_code)]
    fn dropped(&self) -> u32 {
        unsafe { self.dropped.as_ref() }.load(Ordering::Acquire)
    }

    /// Safety: the caller must hold the submission lock and `idx` must be a
    /// masked slot index.
    unsafe fn write_sqe(&self, idx: u32, sqe: Sqe) {
        debug_assert!(idx < self.entries);
        std::ptr::write(self.sqe_base.as_ptr().add(idx as usize), sqe);
    }

    // The kernel resolves SQ slots through the indirection array; we always
    // place SQE i in slot i, so the identity mapping is written once.
    fn init_identity_array(&self) {
        for i in 0..self.entries {
            unsafe { std::ptr::write(self.array.as_ptr().add(i as usize), i) };
        }
    }
}

/// Typed view over the mapped CQ ring. Only the kernel writes the tail;
/// user space advances the head by CAS so multiple readers are safe.
#[derive(Debug)]
struct Cq {
    head: NonNull<AtomicU32>,
    tail: NonNull<AtomicU32>,
    overflow: NonNull<AtomicU32>,
    cqe_base: NonNull<Cqe>,
    mask: u32,
    #[allow(dead_code)]
    entries: u32,
    _ring: Mapping,
}

impl Cq {
    fn head(&self) -> u32 {
        unsafe { self.head.as_ref() }.load(Ordering::Acquire)
    }

    fn tail(&self) -> u32 {
        unsafe { self.tail.as_ref() }.load(Ordering::Acquire)
    }

    #[allow(dead_code)]
    fn overflow(&self) -> u32 {
        unsafe { self.overflow.as_ref() }.load(Ordering::Acquire)
    }

    fn cqe_at(&self, head: u32) -> Cqe {
        unsafe { std::ptr::read(self.cqe_base.as_ptr().add((head & self.mask) as usize)) }
    }

    fn advance_head(&self, head: u32) -> bool {
        unsafe { self.head.as_ref() }
            .compare_exchange(
                head,
                head.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// The io_uring ring: mapped SQ/CQ regions, a submission API, and the
/// in-flight table that threads caller contexts through `user_data`.
#[derive(Debug)]
pub struct Ring {
    fd: OwnedFd,
    setup_flags: SetupFlags,
    sq_entries: u32,
    cq_entries: u32,
    sq: Sq,
    cq: Cq,
    sq_lock: AtomicBool,
    pub(crate) inflight: InflightTable,
    registered: Mutex<Option<Vec<AlignedBlock>>>,
}

// Safety: the interior pointers target kernel-shared mappings owned by the
// ring; SQ writes are serialized by `sq_lock` and CQ head advances by CAS.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    pub fn new(cfg: RingConfig) -> Result<Self> {
        if cfg.queue_depth < 1 {
            return Err(Error::InvalidParam);
        }

        let mut params = IoUringParams::default();
        let mut flags = SetupFlags::empty();
        if cfg.iopoll {
            flags |= SetupFlags::IOPOLL;
        }
        if cfg.sqpoll {
            flags |= SetupFlags::SQPOLL | SetupFlags::SQ_AFF;
            params.sq_thread_cpu = cfg.sq_thread_cpu;
            params.sq_thread_idle = cfg.sq_thread_idle.as_millis().min(u32::MAX as u128) as u32;
        }
        params.flags = flags.bits();

        let raw_fd = io_uring_setup(cfg.queue_depth, &mut params)?;
        let fd = unsafe { OwnedFd::from_raw_fd(raw_fd) };

        let sq_ring_len =
            params.sq_off.array as usize + params.sq_entries as usize * std::mem::size_of::<u32>();
        let sqes_len = params.sq_entries as usize * std::mem::size_of::<Sqe>();
        let cq_ring_len =
            params.cq_off.cqes as usize + params.cq_entries as usize * std::mem::size_of::<Cqe>();

        let sq_ring = Mapping::map(fd.as_fd(), sq_ring_len, IORING_OFF_SQ_RING)?;
        let sqes = Mapping::map(fd.as_fd(), sqes_len, IORING_OFF_SQES)?;
        let cq_ring = Mapping::map(fd.as_fd(), cq_ring_len, IORING_OFF_CQ_RING)?;

        let sq_mask = unsafe { *sq_ring.offset_as::<u32>(params.sq_off.ring_mask).as_ref() };
        let cq_mask = unsafe { *cq_ring.offset_as::<u32>(params.cq_off.ring_mask).as_ref() };

        let sq = Sq {
            head: sq_ring.offset_as(params.sq_off.head),
            tail: sq_ring.offset_as(params.sq_off.tail),
            flags: sq_ring.offset_as(params.sq_off.flags),
            dropped: sq_ring.offset_as(params.sq_off.dropped),
            array: sq_ring.offset_as(params.sq_off.array),
            sqe_base: sqes.offset_as(0),
            mask: sq_mask,
            entries: params.sq_entries,
            _ring: sq_ring,
            _sqes: sqes,
        };
        sq.init_identity_array();

        let cq = Cq {
            head: cq_ring.offset_as(params.cq_off.head),
            tail: cq_ring.offset_as(params.cq_off.tail),
            overflow: cq_ring.offset_as(params.cq_off.overflow),
            cqe_base: cq_ring.offset_as(params.cq_off.cqes),
            mask: cq_mask,
            entries: params.cq_entries,
            _ring: cq_ring,
        };

        tracing::debug!(
            ring_fd = raw_fd,
            sq_entries = params.sq_entries,
            cq_entries = params.cq_entries,
            flags = ?flags,
            "io_uring ring mapped"
        );

        Ok(Self {
            fd,
            setup_flags: flags,
            sq_entries: params.sq_entries,
            cq_entries: params.cq_entries,
            sq,
            cq,
            sq_lock: AtomicBool::new(false),
            inflight: InflightTable::new(params.cq_entries as usize),
            registered: Mutex::new(None),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn sq_entries(&self) -> u32 {
        self.sq_entries
    }

    pub fn cq_entries(&self) -> u32 {
        self.cq_entries
    }

    /// Number of submitted operations whose completions have not been
    /// reaped yet.
    pub fn pending(&self) -> usize {
        self.inflight.pending()
    }

    /// Places one SQE. The submission lock is held only for the duration of
    /// the SQE write; a full SQ surfaces
    /// [`Error::TemporarilyUnavailable`].
    pub(crate) fn submit_raw(
        &self,
        op: Opcode,
        fd: RawFd,
        off: u64,
        addr: u64,
        len: u32,
        op_flags: u32,
        user_data: u64,
    ) -> Result<()> {
        let mut sw = SpinWait::new();
        while self
            .sq_lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            sw.once();
        }
        let res = self.fill_sqe(op, fd, off, addr, len, op_flags, user_data);
        self.sq_lock.store(false, Ordering::Release);
        res
    }

    fn fill_sqe(
        &self,
        op: Opcode,
        fd: RawFd,
        off: u64,
        addr: u64,
        len: u32,
        op_flags: u32,
        user_data: u64,
    ) -> Result<()> {
        let head = self.sq.head();
        let tail = self.sq.tail();
        if tail.wrapping_sub(head) >= self.sq.entries {
            return Err(Error::TemporarilyUnavailable);
        }
        let sqe = Sqe {
            opcode: op as u8,
            flags: super::SqeFlags::ASYNC.bits(),
            fd,
            off,
            addr,
            len,
            op_flags,
            user_data,
            ..Sqe::default()
        };
        unsafe { self.sq.write_sqe(tail & self.sq.mask, sqe) };
        self.sq.publish_tail(tail.wrapping_add(1));
        Ok(())
    }

    /// Delivers pending submissions to the kernel.
    ///
    /// With SQPOLL, this only issues a wake-up when the poller thread has
    /// parked; otherwise it enters with the full queue depth whenever the
    /// SQ is non-empty.
    pub fn enter(&self) -> Result<()> {
        if self.sq.flags().contains(SqFlags::NEED_WAKEUP) {
            io_uring_enter(
                self.fd.as_raw_fd(),
                self.sq_entries,
                0,
                EnterFlags::SQ_WAKEUP,
            )?;
        }
        if !self.setup_flags.contains(SetupFlags::SQPOLL) && self.sq.head() != self.sq.tail() {
            io_uring_enter(self.fd.as_raw_fd(), self.sq_entries, 0, EnterFlags::empty())?;
        }
        Ok(())
    }

    /// Enters with GETEVENTS until at least `min_complete` completions are
    /// available. Required to advance the CQ in IOPOLL mode.
    pub fn poll(&self, min_complete: u32) -> Result<()> {
        io_uring_enter(
            self.fd.as_raw_fd(),
            0,
            min_complete,
            EnterFlags::GETEVENTS,
        )?;
        Ok(())
    }

    /// Pops the next CQE, or [`Error::TemporarilyUnavailable`] when the CQ
    /// is empty. Safe to call from multiple threads.
    pub fn wait(&self) -> Result<Cqe> {
        let mut sw = SpinWait::new();
        loop {
            let head = self.cq.head();
            let tail = self.cq.tail();
            if head == tail {
                return Err(Error::TemporarilyUnavailable);
            }
            let cqe = self.cq.cqe_at(head);
            if self.cq.advance_head(head) {
                return Ok(cqe);
            }
            sw.once();
        }
    }

    /// Pops the next CQE and resolves its context from the in-flight table.
    ///
    /// For completions flagged [`CqeFlags::MORE`] the table entry stays
    /// alive for the follow-up CQE (zero-copy notifications).
    pub fn next_completion(&self) -> Result<Completion> {
        loop {
            let cqe = self.wait()?;
            let key = cqe.user_data() as usize;
            let context = if cqe.flags().contains(CqeFlags::MORE) {
                self.inflight.get_cloned(key)
            } else {
                self.inflight.remove(key)
            };
            match context {
                Some(context) => return Ok(Completion { context, cqe }),
                None => {
                    tracing::warn!(
                        user_data = cqe.user_data(),
                        res = cqe.raw_result(),
                        "completion with unknown user_data"
                    );
                }
            }
        }
    }

    /// Registers an eventfd that the kernel posts from async completions,
    /// and adds it edge-triggered to `poller`, integrating ring completions
    /// with an epoll loop.
    pub fn register_eventfd_async(&self, poller: &Poller) -> Result<Eventfd> {
        let efd = Eventfd::new()?;
        let raw: libc::c_int = efd.as_raw_fd();
        io_uring_register(
            self.fd.as_raw_fd(),
            IORING_REGISTER_EVENTFD_ASYNC,
            &raw as *const libc::c_int as *const libc::c_void,
            1,
        )?;
        poller.add(efd.as_raw_fd(), Interest::IN | Interest::ET)?;
        Ok(efd)
    }

    /// Allocates `n` page-aligned buffers of power-of-two `size` and
    /// registers them with the ring. The ring owns the buffers until
    /// [`unregister_buffers`](Ring::unregister_buffers) returns them.
    pub fn register_buffers(&self, n: usize, size: usize) -> Result<()> {
        if n < 1 || !size.is_power_of_two() {
            return Err(Error::InvalidParam);
        }
        let mut registered = self.registered.lock();
        if registered.is_some() {
            return Err(Error::InvalidParam);
        }
        let blocks = (0..n)
            .map(|_| AlignedBlock::with_len(size))
            .collect::<Vec<_>>();
        let iovecs = blocks
            .iter()
            .map(|block| libc::iovec {
                iov_base: block.as_ptr() as *mut libc::c_void,
                iov_len: size,
            })
            .collect::<Vec<_>>();
        io_uring_register(
            self.fd.as_raw_fd(),
            IORING_REGISTER_BUFFERS,
            iovecs.as_ptr() as *const libc::c_void,
            n as u32,
        )?;
        *registered = Some(blocks);
        Ok(())
    }

    /// Unregisters and returns the buffer group.
    pub fn unregister_buffers(&self) -> Result<Vec<AlignedBlock>> {
        let mut registered = self.registered.lock();
        let blocks = registered.take().ok_or(Error::InvalidParam)?;
        io_uring_register(
            self.fd.as_raw_fd(),
            IORING_UNREGISTER_BUFFERS,
            std::ptr::null(),
            0,
        )?;
        Ok(blocks)
    }
}

impl AsRawFd for Ring {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// A reaped completion: the CQE plus the context of the submission that
/// produced it.
#[derive(Debug)]
pub struct Completion {
    pub context: Context,
    pub cqe: Cqe,
}

impl Completion {
    /// The fd the operation was submitted against.
    pub fn fd(&self) -> RawFd {
        self.context.fd()
    }

    /// The byte count, or the taxonomy error decoded from a negative
    /// kernel result.
    pub fn result(&self) -> Result<u32> {
        self.cqe.result()
    }

    pub fn flags(&self) -> CqeFlags {
        self.cqe.flags()
    }
}

fn io_uring_setup(entries: u32, params: &mut IoUringParams) -> Result<RawFd> {
    let res = unsafe {
        libc::syscall(
            libc::SYS_io_uring_setup,
            entries as libc::c_ulong,
            params as *mut IoUringParams,
        )
    };
    Ok(Errno::result(res)? as RawFd)
}

fn io_uring_enter(fd: RawFd, to_submit: u32, min_complete: u32, flags: EnterFlags) -> Result<u32> {
    let res = unsafe {
        libc::syscall(
            libc::SYS_io_uring_enter,
            fd,
            to_submit,
            min_complete,
            flags.bits(),
            std::ptr::null::<libc::sigset_t>(),
            0usize,
        )
    };
    Ok(Errno::result(res)? as u32)
}

fn io_uring_register(
    fd: RawFd,
    opcode: libc::c_uint,
    arg: *const libc::c_void,
    nr_args: u32,
) -> Result<()> {
    let res = unsafe { libc::syscall(libc::SYS_io_uring_register, fd, opcode, arg, nr_args) };
    Errno::result(res)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Rings cannot be created in every environment (io_uring may be
    /// disabled by seccomp or sysctl); skip rather than fail there.
    pub(crate) fn try_ring(cfg: RingConfig) -> Option<Ring> {
        match Ring::new(cfg) {
            Ok(ring) => Some(ring),
            Err(Error::NoPermission)
            | Err(Error::NoAvailableMemory)
            | Err(Error::Os(Errno::ENOSYS)) => {
                eprintln!("skipping: io_uring is not available in this environment");
                None
            }
            Err(e) => panic!("ring setup: {}", e),
        }
    }

    /// Reaps one completion, driving the CQ as IOPOLL requires, with a
    /// deadline to keep broken tests from hanging.
    pub(crate) fn wait_completion(ring: &Ring, timeout: Duration) -> Completion {
        let deadline = std::time::Instant::now() + timeout;
        let mut sw = SpinWait::new();
        loop {
            ring.poll(1).expect("io_uring_enter GETEVENTS");
            match ring.next_completion() {
                Ok(completion) => return completion,
                Err(Error::TemporarilyUnavailable) => {
                    assert!(
                        std::time::Instant::now() < deadline,
                        "timed out waiting for a completion"
                    );
                    sw.once();
                }
                Err(e) => panic!("completion: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_invalid_queue_depth() {
        assert_eq!(
            Ring::new(RingConfig::default().queue_depth(0)).unwrap_err(),
            Error::InvalidParam
        );
    }

    #[test]
    fn test_wait_on_empty_cq() {
        let Some(ring) = try_ring(RingConfig::default().queue_depth(16)) else {
            return;
        };
        assert_eq!(ring.wait().unwrap_err(), Error::TemporarilyUnavailable);
    }

    #[test]
    fn test_nop_carries_context() -> anyhow::Result<()> {
        crate::test_utils::init_tracing();
        let Some(ring) = try_ring(RingConfig::default().queue_depth(16)) else {
            return Ok(());
        };
        let ctx = Context::new().with_value(0xC0FFEEu64);
        ring.nop(ctx, -1)?;
        assert_eq!(ring.pending(), 1);
        ring.enter()?;

        let completion = wait_completion(&ring, Duration::from_secs(2));
        assert_eq!(completion.result()?, 0);
        assert_eq!(completion.context.value::<u64>(), Some(&0xC0FFEE));
        assert_eq!(completion.fd(), -1);
        assert_eq!(ring.pending(), 0);
        Ok(())
    }

    #[test]
    fn test_sq_fills_up_without_enter() {
        let Some(ring) = try_ring(RingConfig::default().queue_depth(8)) else {
            return;
        };
        for _ in 0..ring.sq_entries() {
            ring.nop(Context::new(), -1).unwrap();
        }
        assert_eq!(
            ring.nop(Context::new(), -1).unwrap_err(),
            Error::TemporarilyUnavailable
        );
    }

    #[rstest]
    #[case::group_of_one(1, 4096)]
    #[case::group_of_four(4, 4096)]
    #[case::large_buffers(2, 65536)]
    fn test_buffer_registration(#[case] n: usize, #[case] size: usize) {
        let Some(ring) = try_ring(RingConfig::default().queue_depth(16)) else {
            return;
        };
        match ring.register_buffers(n, size) {
            Ok(()) => {}
            // Buffer registration charges the memlock quota, which can be
            // tiny in containers.
            Err(Error::NoAvailableMemory) | Err(Error::NoPermission) => {
                eprintln!("skipping: memlock limit too low for registration");
                return;
            }
            Err(e) => panic!("register: {}", e),
        }
        // A second registration without unregistering is invalid.
        assert_eq!(
            ring.register_buffers(n, size).unwrap_err(),
            Error::InvalidParam
        );
        let blocks = ring.unregister_buffers().unwrap();
        assert_eq!(blocks.len(), n);
        for block in &blocks {
            assert!(block.len() >= size);
            assert_eq!(block.as_ptr() as usize % crate::buffers::page_size(), 0);
        }
    }

    #[test]
    fn test_non_pow2_registration_size_rejected() {
        let Some(ring) = try_ring(RingConfig::default().queue_depth(16)) else {
            return;
        };
        assert_eq!(
            ring.register_buffers(1, 3000).unwrap_err(),
            Error::InvalidParam
        );
    }

    #[test]
    fn test_eventfd_integration_with_poller() -> anyhow::Result<()> {
        crate::test_utils::init_tracing();
        let Some(ring) = try_ring(RingConfig::default().queue_depth(16)) else {
            return Ok(());
        };
        let mut poller = Poller::new(8)?;
        let efd = ring.register_eventfd_async(&poller)?;

        ring.nop(Context::new(), -1)?;
        ring.enter()?;

        // The async nop posts to the registered eventfd and wakes epoll.
        let events = poller.wait(Some(Duration::from_secs(2)))?;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].fd, efd.as_raw_fd());
        assert!(efd.read_u64()? >= 1);

        let completion = wait_completion(&ring, Duration::from_secs(2));
        assert_eq!(completion.result()?, 0);
        Ok(())
    }

    #[test]
    fn test_sqpoll_mode_nop() {
        let Some(ring) = try_ring(RingConfig::default().queue_depth(16).sqpoll()) else {
            return;
        };
        ring.nop(Context::new().with_value(1u8), -1).unwrap();
        ring.enter().unwrap();
        let completion = wait_completion(&ring, Duration::from_secs(2));
        assert_eq!(completion.result().unwrap(), 0);
    }
}
