use crate::errors::{Error, Result};
use nix::errno::Errno;
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::time::{Duration, Instant};

/// A monotonic-clock tick channel: a nonblocking timerfd whose interval and
/// initial expiration are both the given duration.
///
/// A read returns the number of ticks that expired since the last read. The
/// tick time reported by [`now`](Timerfd::now) is derived as
/// start + interval x total ticks, which keeps it on the timer grid rather
/// than on the (later) moment the read happened.
#[derive(Debug)]
pub struct Timerfd {
    inner: TimerFd,
    started_at: Instant,
    interval: Duration,
    total_ticks: u64,
}

impl Timerfd {
    pub fn new(interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(Error::InvalidParam);
        }
        let inner = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )?;
        inner.set(
            Expiration::Interval(TimeSpec::from_duration(interval)),
            TimerSetTimeFlags::empty(),
        )?;
        Ok(Self {
            inner,
            started_at: Instant::now(),
            interval,
            total_ticks: 0,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.inner.as_fd().as_raw_fd()
    }

    /// Returns the number of ticks expired since the last read, or
    /// [`Error::TemporarilyUnavailable`] if none have.
    pub fn read_ticks(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        let n = Errno::result(unsafe {
            libc::read(self.fd(), buf.as_mut_ptr().cast(), buf.len())
        })?;
        debug_assert_eq!(n, 8);
        let missed = u64::from_le_bytes(buf);
        self.total_ticks += missed;
        Ok(missed)
    }

    /// The time of the most recently read tick.
    pub fn now(&self) -> Instant {
        self.started_at + self.interval * self.total_ticks as u32
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl AsRawFd for Timerfd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd()
    }
}

impl AsFd for Timerfd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_zero_interval_rejected() {
        assert_eq!(
            Timerfd::new(Duration::ZERO).unwrap_err(),
            Error::InvalidParam
        );
    }

    #[test]
    fn test_unexpired_read_is_unavailable() {
        let mut timer = Timerfd::new(Duration::from_secs(60)).unwrap();
        assert_eq!(
            timer.read_ticks().unwrap_err(),
            Error::TemporarilyUnavailable
        );
    }

    #[test]
    fn test_missed_ticks_accumulate() {
        let mut timer = Timerfd::new(Duration::from_millis(10)).unwrap();
        let start = timer.now();
        thread::sleep(Duration::from_millis(55));
        let missed = timer.read_ticks().unwrap();
        assert!(missed >= 4, "expected >= 4 ticks, got {}", missed);
        assert_eq!(timer.now() - start, timer.interval() * missed as u32);
    }
}
