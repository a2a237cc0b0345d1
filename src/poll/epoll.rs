use crate::errors::{Error, Result};
use bitflags::bitflags;
use nix::errno::Errno;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

bitflags!(
    /// Readiness interest and event set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interest: u32 {
        const IN = libc::EPOLLIN as u32;
        const OUT = libc::EPOLLOUT as u32;
        const ERR = libc::EPOLLERR as u32;
        const HUP = libc::EPOLLHUP as u32;
        const RDHUP = libc::EPOLLRDHUP as u32;
        /// Edge-triggered: one notification per not-ready to ready
        /// transition; the caller must drain the fd fully.
        const ET = libc::EPOLLET as u32;
    }
);

impl From<u32> for Interest {
    fn from(value: u32) -> Self {
        Self::from_bits_retain(value)
    }
}

/// One readiness notification.
#[derive(Debug, Clone, Copy)]
pub struct PollEvent {
    pub fd: RawFd,
    pub events: Interest,
}

/// An edge-triggered readiness poller over an epoll instance.
///
/// The event array is allocated once, at the capacity chosen at
/// construction; the slice returned by [`wait`](Poller::wait) aliases it and
/// is only valid until the next `wait` on the same poller.
#[derive(Debug)]
pub struct Poller {
    fd: OwnedFd,
    raw: Vec<libc::epoll_event>,
    events: Vec<PollEvent>,
}

impl Poller {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity < 1 {
            return Err(Error::InvalidParam);
        }
        let fd = Errno::result(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            raw: vec![libc::epoll_event { events: 0, u64: 0 }; capacity],
            events: Vec::with_capacity(capacity),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Registers `fd` for the given interest set.
    pub fn add(&self, fd: RawFd, interest: Interest) -> Result<()> {
        let mut event = libc::epoll_event {
            events: interest.bits(),
            u64: fd as u64,
        };
        Errno::result(unsafe {
            libc::epoll_ctl(self.fd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event)
        })?;
        Ok(())
    }

    /// Unregisters `fd`.
    pub fn del(&self, fd: RawFd) -> Result<()> {
        Errno::result(unsafe {
            libc::epoll_ctl(
                self.fd.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        })?;
        Ok(())
    }

    /// Waits up to `timeout` for readiness events. `None` blocks
    /// indefinitely; a zero duration polls without blocking.
    ///
    /// An interrupted wait surfaces [`Error::InterruptedSyscall`] and is not
    /// retried here; the caller owns the retry loop.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<&[PollEvent]> {
        let msec = match timeout {
            None => -1i32,
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
        };
        let n = Errno::result(unsafe {
            libc::epoll_wait(
                self.fd.as_raw_fd(),
                self.raw.as_mut_ptr(),
                self.raw.len() as i32,
                msec,
            )
        })?;
        self.events.clear();
        for raw in &self.raw[..n as usize] {
            self.events.push(PollEvent {
                fd: raw.u64 as RawFd,
                events: Interest::from(raw.events),
            });
        }
        Ok(&self.events)
    }
}

impl AsRawFd for Poller {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for Poller {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::Eventfd;
    use rstest::rstest;

    #[test]
    fn test_invalid_capacity() {
        assert_eq!(Poller::new(0).unwrap_err(), Error::InvalidParam);
    }

    /// Eventfd-through-epoll scenario: counting writes coalesce into single
    /// edge notifications, and deletion stops delivery.
    #[test]
    fn test_eventfd_through_epoll() {
        let mut poller = Poller::new(16).unwrap();
        let efd = Eventfd::new().unwrap();
        poller.add(efd.as_raw_fd(), Interest::IN | Interest::ET).unwrap();

        // Nothing written yet: the wait times out empty.
        let events = poller.wait(Some(Duration::from_millis(200))).unwrap();
        assert!(events.is_empty());

        efd.write_u64(5).unwrap();
        let events = poller.wait(Some(Duration::from_millis(200))).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].fd, efd.as_raw_fd());
        assert!(events[0].events.contains(Interest::IN));
        assert_eq!(efd.read_u64().unwrap(), 5);

        // Two writes without an intervening read: one edge notification,
        // accumulated count.
        efd.write_u64(5).unwrap();
        efd.write_u64(10).unwrap();
        let events = poller.wait(Some(Duration::from_millis(200))).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(efd.read_u64().unwrap(), 15);

        poller.del(efd.as_raw_fd()).unwrap();
        efd.write_u64(1).unwrap();
        let events = poller.wait(Some(Duration::from_millis(100))).unwrap();
        assert!(events.is_empty());
    }

    #[rstest]
    #[case::zero_timeout(Some(Duration::ZERO))]
    #[case::short_timeout(Some(Duration::from_millis(10)))]
    fn test_wait_without_events(#[case] timeout: Option<Duration>) {
        let mut poller = Poller::new(4).unwrap();
        let events = poller.wait(timeout).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_del_unknown_fd() {
        let poller = Poller::new(4).unwrap();
        let efd = Eventfd::new().unwrap();
        assert!(poller.del(efd.as_raw_fd()).is_err());
    }
}
