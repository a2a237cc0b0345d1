//! Asynchronous socket I/O and event notification for Linux.
//!
//! The crate binds directly to the `io_uring` submission/completion rings and
//! the epoll readiness interface, and layers a small set of lock-free
//! primitives, a length-prefixed message framer, and nonblocking sockets on
//! top. Requires Linux >= 5.15.

pub mod buffers;

pub mod context;
pub use context::Context;

pub mod errors;
pub use errors::{Error, Result};

pub mod events;

pub mod message;

pub mod net;

pub mod poll;

pub mod sync;

#[cfg(test)]
pub(crate) mod test_utils;

pub mod uring;
