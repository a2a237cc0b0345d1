use crate::errors::Result;
use nix::errno::Errno;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

/// A nonblocking, close-on-exec eventfd with counting semantics.
///
/// Writes add to a kernel-held 64-bit counter; a read drains the
/// accumulated value and resets it. Reading a zero counter returns
/// [`crate::Error::TemporarilyUnavailable`]; a write of zero does not make
/// the fd readable.
#[derive(Debug)]
pub struct Eventfd(OwnedFd);

impl Eventfd {
    pub fn new() -> Result<Self> {
        let fd = Errno::result(unsafe {
            libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC)
        })?;
        Ok(Self(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    pub fn fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }

    /// Drains and returns the accumulated counter.
    pub fn read_u64(&self) -> Result<u64> {
        let mut buf = [0u8; 8];
        let n = Errno::result(unsafe {
            libc::read(self.0.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
        })?;
        debug_assert_eq!(n, 8);
        Ok(u64::from_le_bytes(buf))
    }

    /// Adds `val` to the counter.
    pub fn write_u64(&self, val: u64) -> Result<()> {
        let buf = val.to_le_bytes();
        Errno::result(unsafe {
            libc::write(self.0.as_raw_fd(), buf.as_ptr().cast(), buf.len())
        })?;
        Ok(())
    }
}

impl AsRawFd for Eventfd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl AsFd for Eventfd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;

    #[test]
    fn test_counting_semantics() {
        let efd = Eventfd::new().unwrap();
        efd.write_u64(3).unwrap();
        efd.write_u64(4).unwrap();
        assert_eq!(efd.read_u64().unwrap(), 7);
    }

    #[test]
    fn test_empty_read_is_unavailable() {
        let efd = Eventfd::new().unwrap();
        assert_eq!(efd.read_u64().unwrap_err(), Error::TemporarilyUnavailable);
    }

    #[test]
    fn test_zero_write_does_not_wake() {
        let efd = Eventfd::new().unwrap();
        efd.write_u64(0).unwrap();
        assert_eq!(efd.read_u64().unwrap_err(), Error::TemporarilyUnavailable);
    }
}
