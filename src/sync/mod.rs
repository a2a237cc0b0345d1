//! Lock-free and low-lock primitives used to pass work between producers,
//! consumers, and the polling loop.

pub mod spin;
pub use spin::{Level, SpinWait, SpinWaiter, JIFFY};

pub mod ring_queue;
pub use ring_queue::{
    MpmcRingQueue, MpscRingQueue, RingQueue, RingQueueOptions, SpmcRingQueue, SpscRingQueue,
};

pub mod stack;
pub use stack::{FixedStack, FixedStackOptions, SerialFixedStack};

use crate::errors::Result;

/// The producing half of a bounded container: push items until [`close`].
///
/// [`close`]: ItemProducer::close
pub trait ItemProducer<T> {
    fn produce(&self, item: T) -> Result<()>;
    fn close(&self);
}

/// The consuming half of a bounded container: drain items until end of
/// stream.
pub trait ItemConsumer<T> {
    fn consume(&self) -> Result<T>;
}
