use crate::errors::{Error, Result};
use crate::sync::spin::{Level, SpinWaiter};
use crate::sync::{ItemConsumer, ItemProducer};
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Default capacity of a ring queue before rounding.
pub const DEFAULT_RING_QUEUE_CAPACITY: u32 = i16::MAX as u32;

// The tail word carries two status bits above the 30-bit slot index. The
// writing bit serializes the two-step store/publish of concurrent producers;
// the closed bit is sticky.
const STATUS_WRITING: u32 = 1 << 31;
const STATUS_CLOSED: u32 = 1 << 30;
const VALUE_MASK: u32 = (1 << 30) - 1;

/// Concurrency contract of one side (producer or consumer) of a bounded
/// container.
///
/// [`Single`] promises that at most one thread touches that side at a time;
/// [`Many`] allows any number. The marker selects, at compile time, whether
/// the side claims slots with a CAS and gates visibility through the
/// writing bit, or uses plain loads and stores.
pub trait Concurrency: sealed::Sealed + 'static {
    const CONCURRENT: bool;
}

/// At most one thread uses this side at a time.
#[derive(Debug)]
pub enum Single {}

/// Any number of threads may use this side simultaneously.
#[derive(Debug)]
pub enum Many {}

impl Concurrency for Single {
    const CONCURRENT: bool = false;
}

impl Concurrency for Many {
    const CONCURRENT: bool = true;
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::Single {}
    impl Sealed for super::Many {}
}

/// Optional parameters for [`RingQueue`].
#[derive(Debug, Clone, Copy)]
pub struct RingQueueOptions {
    /// Requested capacity; rounded up to the next 2^n - 1. Must satisfy
    /// 1 <= capacity < 2^30.
    pub capacity: u32,
    /// When true, produce on full and consume on empty return
    /// [`Error::TemporarilyUnavailable`] instead of spinning.
    pub nonblocking: bool,
}

impl Default for RingQueueOptions {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_RING_QUEUE_CAPACITY,
            nonblocking: false,
        }
    }
}

/// A bounded power-of-two FIFO with producer/consumer/close concurrency
/// contracts.
///
/// The `P` and `C` parameters pick the concurrency mode of the producing and
/// consuming side; see the [`SpscRingQueue`], [`MpscRingQueue`],
/// [`SpmcRingQueue`] and [`MpmcRingQueue`] aliases.
///
/// Items are observed in FIFO order per producer. After [`close`], producers
/// fail with [`Error::ClosedPipe`]; consumers drain the remaining items and
/// then see [`Error::EndOfStream`].
///
/// [`close`]: RingQueue::close
#[derive(Debug)]
pub struct RingQueue<T, P: Concurrency = Many, C: Concurrency = Many> {
    ring: Box<[UnsafeCell<MaybeUninit<T>>]>,
    capacity: u32,
    head: AtomicU32,
    tail: AtomicU32,
    // Closed flag for serial-producer variants, whose tail word is written
    // with plain stores and must not race the sticky bit.
    closed: AtomicBool,
    nonblocking: bool,
    _mode: PhantomData<(P, C)>,
}

unsafe impl<T: Send, P: Concurrency, C: Concurrency> Send for RingQueue<T, P, C> {}
unsafe impl<T: Send, P: Concurrency, C: Concurrency> Sync for RingQueue<T, P, C> {}

/// Single producer, single consumer.
pub type SpscRingQueue<T> = RingQueue<T, Single, Single>;
/// Concurrent producers, single consumer.
pub type MpscRingQueue<T> = RingQueue<T, Many, Single>;
/// Single producer, concurrent consumers.
pub type SpmcRingQueue<T> = RingQueue<T, Single, Many>;
/// Concurrent producers and consumers.
pub type MpmcRingQueue<T> = RingQueue<T, Many, Many>;

impl<T, P: Concurrency, C: Concurrency> RingQueue<T, P, C> {
    pub fn new() -> Result<Self> {
        Self::with_options(RingQueueOptions::default())
    }

    pub fn with_options(opts: RingQueueOptions) -> Result<Self> {
        if opts.capacity < 1 || opts.capacity >= (1 << 30) {
            return Err(Error::InvalidParam);
        }
        let capacity = round_up_mask(opts.capacity);
        let ring = (0..=capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            ring,
            capacity,
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            nonblocking: opts.nonblocking,
            _mode: PhantomData,
        })
    }

    /// The rounded capacity: the queue holds at most this many items.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Appends an item at the tail.
    ///
    /// Blocks (spins) while the queue is full unless the queue is
    /// nonblocking, in which case it returns
    /// [`Error::TemporarilyUnavailable`]. Returns [`Error::ClosedPipe`] once
    /// the queue has been closed.
    pub fn produce(&self, item: T) -> Result<()> {
        if P::CONCURRENT {
            self.produce_concurrent(item)
        } else {
            self.produce_serial(item)
        }
    }

    /// Removes and returns the item at the head, in FIFO order.
    ///
    /// Returns [`Error::EndOfStream`] once the queue is empty and closed,
    /// and [`Error::TemporarilyUnavailable`] when it is empty and
    /// nonblocking.
    pub fn consume(&self) -> Result<T> {
        if C::CONCURRENT {
            self.consume_concurrent()
        } else {
            self.consume_serial()
        }
    }

    /// Closes the queue. Idempotent; never fails.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if !P::CONCURRENT {
            return;
        }
        // Concurrent producers observe closure through the tail bit, which
        // must not be set while a producer holds the writing bit.
        let mut sw = SpinWaiter::new().level(Level::Produce);
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            if tail & STATUS_CLOSED != 0 {
                return;
            }
            if tail & STATUS_WRITING != 0 {
                sw.once();
                continue;
            }
            match self.tail.compare_exchange(
                tail,
                tail | STATUS_CLOSED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(_) => sw.once_with_level(Level::Atomic),
            }
        }
    }

    fn is_closed(&self, tail: u32) -> bool {
        if P::CONCURRENT {
            tail & STATUS_CLOSED != 0
        } else {
            self.closed.load(Ordering::Acquire)
        }
    }

    fn produce_serial(&self, item: T) -> Result<()> {
        let mut sw = SpinWaiter::new().level(Level::Produce);
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::ClosedPipe);
            }
            let tail = self.tail.load(Ordering::Relaxed) & VALUE_MASK;
            let head = self.head.load(Ordering::Acquire) & VALUE_MASK;
            if (tail + 1) & self.capacity == head {
                if self.nonblocking {
                    return Err(Error::TemporarilyUnavailable);
                }
                sw.once();
                continue;
            }
            unsafe { (*self.ring[tail as usize].get()).write(item) };
            self.tail
                .store((tail + 1) & self.capacity, Ordering::Release);
            return Ok(());
        }
    }

    fn produce_concurrent(&self, item: T) -> Result<()> {
        let mut sw = SpinWaiter::new().level(Level::Produce);
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            if tail & STATUS_WRITING != 0 {
                sw.once();
                continue;
            }
            if tail & STATUS_CLOSED != 0 {
                return Err(Error::ClosedPipe);
            }
            let tail_val = tail & VALUE_MASK;
            let head = self.head.load(Ordering::Acquire) & VALUE_MASK;
            if (tail_val + 1) & self.capacity == head {
                if self.nonblocking {
                    return Err(Error::TemporarilyUnavailable);
                }
                sw.once();
                continue;
            }
            let claimed = STATUS_WRITING | (tail & STATUS_CLOSED) | ((tail_val + 1) & self.capacity);
            if self
                .tail
                .compare_exchange(tail, claimed, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                sw.once_with_level(Level::Atomic);
                continue;
            }
            unsafe { (*self.ring[tail_val as usize].get()).write(item) };
            // Publish: drop the writing bit with a plain store, preserving
            // the closed bit and the bumped index.
            self.tail.store(claimed & !STATUS_WRITING, Ordering::Release);
            return Ok(());
        }
    }

    fn consume_serial(&self) -> Result<T> {
        let mut sw = SpinWaiter::new().level(Level::Consume);
        loop {
            let head = self.head.load(Ordering::Relaxed) & VALUE_MASK;
            let tail = self.tail.load(Ordering::Acquire);
            let tail_val = tail & VALUE_MASK;
            if head == tail_val {
                // Empty and closed wins over a producer still writing.
                if self.is_closed(tail) {
                    return Err(Error::EndOfStream);
                }
                if self.nonblocking {
                    return Err(Error::TemporarilyUnavailable);
                }
                sw.once();
                continue;
            }
            if P::CONCURRENT && tail & STATUS_WRITING != 0 {
                sw.once();
                continue;
            }
            let item = unsafe { (*self.ring[head as usize].get()).assume_init_read() };
            self.head.store((head + 1) & self.capacity, Ordering::Release);
            return Ok(item);
        }
    }

    fn consume_concurrent(&self) -> Result<T> {
        let mut sw = SpinWaiter::new().level(Level::Consume);
        loop {
            let head = self.head.load(Ordering::Acquire) & VALUE_MASK;
            let tail = self.tail.load(Ordering::Acquire);
            let tail_val = tail & VALUE_MASK;
            if head == tail_val {
                if self.is_closed(tail) {
                    return Err(Error::EndOfStream);
                }
                if self.nonblocking {
                    return Err(Error::TemporarilyUnavailable);
                }
                sw.once();
                continue;
            }
            if P::CONCURRENT && tail & STATUS_WRITING != 0 {
                sw.once();
                continue;
            }
            // Claim the slot before loading it; the slot cannot be reused by
            // a producer until the tail wraps all the way around.
            if self
                .head
                .compare_exchange(
                    head,
                    (head + 1) & self.capacity,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                sw.once_with_level(Level::Atomic);
                continue;
            }
            let item = unsafe { (*self.ring[head as usize].get()).assume_init_read() };
            return Ok(item);
        }
    }
}

impl<T, P: Concurrency, C: Concurrency> Drop for RingQueue<T, P, C> {
    fn drop(&mut self) {
        let mut head = self.head.load(Ordering::Relaxed) & VALUE_MASK;
        let tail = self.tail.load(Ordering::Relaxed) & VALUE_MASK;
        while head != tail {
            unsafe { (*self.ring[head as usize].get()).assume_init_drop() };
            head = (head + 1) & self.capacity;
        }
    }
}

impl<T, P: Concurrency, C: Concurrency> ItemProducer<T> for RingQueue<T, P, C> {
    fn produce(&self, item: T) -> Result<()> {
        RingQueue::produce(self, item)
    }

    fn close(&self) {
        RingQueue::close(self)
    }
}

impl<T, P: Concurrency, C: Concurrency> ItemConsumer<T> for RingQueue<T, P, C> {
    fn consume(&self) -> Result<T> {
        RingQueue::consume(self)
    }
}

// Rounds up to the next 2^n - 1 by successive right-shift OR.
fn round_up_mask(mut capacity: u32) -> u32 {
    capacity |= capacity >> 1;
    capacity |= capacity >> 2;
    capacity |= capacity >> 4;
    capacity |= capacity >> 8;
    capacity |= capacity >> 16;
    capacity
}
