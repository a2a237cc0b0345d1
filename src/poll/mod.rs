//! Readiness polling and fd-bearing wake, tick, and signal channels.

pub mod epoll;
pub use epoll::{Interest, PollEvent, Poller};

pub mod eventfd;
pub use eventfd::Eventfd;

pub mod timerfd;
pub use timerfd::Timerfd;

pub mod signalfd;
pub use signalfd::Signalfd;
