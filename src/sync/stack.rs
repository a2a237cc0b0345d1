use crate::errors::{Error, Result};
use crate::sync::spin::{Level, SpinWaiter};
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, Ordering};

/// Default capacity of a fixed stack before rounding.
pub const DEFAULT_FIXED_STACK_CAPACITY: u32 = i16::MAX as u32;

// The top word counts elements in its low 30 bits; the two high bits carry
// the writing and closed sentinels, exactly as the ring queue's tail word.
const STATUS_WRITING: u32 = 1 << 31;
const STATUS_CLOSED: u32 = 1 << 30;
const VALUE_MASK: u32 = (1 << 30) - 1;

/// Concurrency contract of a [`FixedStack`].
pub trait StackMode: sealed::Sealed + 'static {
    const CONCURRENT: bool;
}

/// One pusher and one popper at a time; the top CAS only guards against a
/// racing close.
pub enum Serial {}

/// Multiple pushers or poppers; the writing bit lets the opposing side spin
/// past a transiently inconsistent slot.
pub enum Concurrent {}

impl StackMode for Serial {
    const CONCURRENT: bool = false;
}

impl StackMode for Concurrent {
    const CONCURRENT: bool = true;
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::Serial {}
    impl Sealed for super::Concurrent {}
}

/// Optional parameters for [`FixedStack`].
#[derive(Debug, Clone, Copy)]
pub struct FixedStackOptions {
    /// Requested capacity; rounded up to the next 2^n - 1. Must satisfy
    /// 1 <= capacity < 2^30.
    pub capacity: u32,
    /// When true, push on full and pop on empty return
    /// [`Error::TemporarilyUnavailable`] instead of spinning.
    pub nonblocking: bool,
}

impl Default for FixedStackOptions {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_FIXED_STACK_CAPACITY,
            nonblocking: false,
        }
    }
}

/// A bounded LIFO whose top word encodes the element count plus writing and
/// closed status bits.
///
/// Push inserts at the top; pop removes the most recently pushed element.
/// After [`close`], pushes fail with [`Error::ClosedPipe`]; pops drain the
/// remaining elements and then see [`Error::EndOfStream`].
///
/// [`close`]: FixedStack::close
pub struct FixedStack<T, M: StackMode = Concurrent> {
    stack: Box<[UnsafeCell<MaybeUninit<T>>]>,
    capacity: u32,
    top: AtomicU32,
    nonblocking: bool,
    _mode: PhantomData<M>,
}

unsafe impl<T: Send, M: StackMode> Send for FixedStack<T, M> {}
unsafe impl<T: Send, M: StackMode> Sync for FixedStack<T, M> {}

/// A stack for one pusher and one popper at a time.
pub type SerialFixedStack<T> = FixedStack<T, Serial>;

impl<T, M: StackMode> FixedStack<T, M> {
    pub fn new() -> Result<Self> {
        Self::with_options(FixedStackOptions::default())
    }

    pub fn with_options(opts: FixedStackOptions) -> Result<Self> {
        if opts.capacity < 1 || opts.capacity >= (1 << 30) {
            return Err(Error::InvalidParam);
        }
        let capacity = round_up_mask(opts.capacity);
        let stack = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            stack,
            capacity,
            top: AtomicU32::new(0),
            nonblocking: opts.nonblocking,
            _mode: PhantomData,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Inserts an element at the top of the stack.
    pub fn push(&self, item: T) -> Result<()> {
        if M::CONCURRENT {
            self.push_concurrent(item)
        } else {
            self.push_serial(item)
        }
    }

    /// Removes and returns the element at the top of the stack.
    pub fn pop(&self) -> Result<T> {
        if M::CONCURRENT {
            self.pop_concurrent()
        } else {
            self.pop_serial()
        }
    }

    /// Closes the stack. Idempotent; never fails.
    pub fn close(&self) {
        let mut sw = SpinWaiter::new().level(Level::Produce);
        loop {
            let top = self.top.load(Ordering::Acquire);
            if top & STATUS_CLOSED != 0 {
                return;
            }
            if M::CONCURRENT && top & STATUS_WRITING != 0 {
                sw.once();
                continue;
            }
            match self.top.compare_exchange(
                top,
                top | STATUS_CLOSED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(_) => sw.once_with_level(Level::Atomic),
            }
        }
    }

    fn push_serial(&self, mut item: T) -> Result<()> {
        let mut sw = SpinWaiter::new().level(Level::Produce);
        loop {
            let top = self.top.load(Ordering::Acquire);
            if top & STATUS_CLOSED != 0 {
                return Err(Error::ClosedPipe);
            }
            let count = top & VALUE_MASK;
            if count >= self.capacity {
                if self.nonblocking {
                    return Err(Error::TemporarilyUnavailable);
                }
                sw.once();
                continue;
            }
            unsafe { (*self.stack[count as usize].get()).write(item) };
            match self
                .top
                .compare_exchange(top, top + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(()),
                Err(_) => {
                    // Lost to close(); take the item back out and retry the
                    // closed check.
                    item = unsafe { (*self.stack[count as usize].get()).assume_init_read() };
                    sw.once_with_level(Level::Atomic);
                }
            }
        }
    }

    fn pop_serial(&self) -> Result<T> {
        let mut sw = SpinWaiter::new().level(Level::Consume);
        loop {
            let top = self.top.load(Ordering::Acquire);
            let count = top & VALUE_MASK;
            if count == 0 {
                if top & STATUS_CLOSED != 0 {
                    return Err(Error::EndOfStream);
                }
                if self.nonblocking {
                    return Err(Error::TemporarilyUnavailable);
                }
                sw.once();
                continue;
            }
            match self
                .top
                .compare_exchange(top, top - 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    let item =
                        unsafe { (*self.stack[(count - 1) as usize].get()).assume_init_read() };
                    return Ok(item);
                }
                Err(_) => sw.once_with_level(Level::Atomic),
            }
        }
    }

    fn push_concurrent(&self, item: T) -> Result<()> {
        let mut sw = SpinWaiter::new().level(Level::Produce);
        loop {
            let top = self.top.load(Ordering::Acquire);
            if top & STATUS_WRITING != 0 {
                sw.once();
                continue;
            }
            if top & STATUS_CLOSED != 0 {
                return Err(Error::ClosedPipe);
            }
            let count = top & VALUE_MASK;
            if count >= self.capacity {
                if self.nonblocking {
                    return Err(Error::TemporarilyUnavailable);
                }
                sw.once();
                continue;
            }
            let claimed = STATUS_WRITING | (count + 1);
            if self
                .top
                .compare_exchange(top, claimed, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                sw.once_with_level(Level::Atomic);
                continue;
            }
            unsafe { (*self.stack[count as usize].get()).write(item) };
            self.top.store(claimed & !STATUS_WRITING, Ordering::Release);
            return Ok(());
        }
    }

    fn pop_concurrent(&self) -> Result<T> {
        let mut sw = SpinWaiter::new().level(Level::Consume);
        loop {
            let top = self.top.load(Ordering::Acquire);
            let count = top & VALUE_MASK;
            if count == 0 {
                if top & STATUS_CLOSED != 0 {
                    return Err(Error::EndOfStream);
                }
                if self.nonblocking {
                    return Err(Error::TemporarilyUnavailable);
                }
                sw.once();
                continue;
            }
            if top & STATUS_WRITING != 0 {
                sw.once();
                continue;
            }
            let claimed = STATUS_WRITING | (count - 1);
            if self
                .top
                .compare_exchange(top, claimed, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                sw.once_with_level(Level::Atomic);
                continue;
            }
            let item = unsafe { (*self.stack[(count - 1) as usize].get()).assume_init_read() };
            self.top.store(claimed & !STATUS_WRITING, Ordering::Release);
            return Ok(item);
        }
    }
}

impl<T, M: StackMode> Drop for FixedStack<T, M> {
    fn drop(&mut self) {
        let count = self.top.load(Ordering::Relaxed) & VALUE_MASK;
        for i in 0..count {
            unsafe { (*self.stack[i as usize].get()).assume_init_drop() };
        }
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
