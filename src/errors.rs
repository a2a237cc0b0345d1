use nix::errno::Errno;
use std::io;

/// Closed taxonomy of error kinds surfaced by every layer of the crate.
///
/// Leaf components return their narrow kinds and composites pass them through
/// unchanged. Retries are always explicit at the caller level: nothing in
/// this crate hides [`Error::TemporarilyUnavailable`] behind an internal
/// retry loop.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// EINTR. Callers of low-level primitives may retry.
    #[error("interrupted system call")]
    InterruptedSyscall,

    /// EAGAIN / EWOULDBLOCK. The dominant non-fatal signal for nonblocking
    /// fds and for empty/full lock-free containers.
    #[error("resource temporarily unavailable")]
    TemporarilyUnavailable,

    /// EINPROGRESS. A connect is pending completion.
    #[error("operation in progress")]
    InProgress,

    #[error("invalid param")]
    InvalidParam,

    #[error("fault parameters")]
    FaultParams,

    #[error("operation not permitted")]
    NoPermission,

    #[error("no available kernel memory")]
    NoAvailableMemory,

    #[error("no device")]
    NoDevice,

    #[error("process open fd limit")]
    ProcessFileLimit,

    #[error("system open fd limit")]
    SystemFileLimit,

    /// Producing into a closed queue, stack, or pipe.
    #[error("closed pipe")]
    ClosedPipe,

    /// Consuming from a drained, closed source.
    #[error("end of stream")]
    EndOfStream,

    /// The caller's buffer is smaller than the decoded payload.
    #[error("short buffer")]
    ShortBuffer,

    #[error("short write")]
    ShortWrite,

    /// The underlying stream ended in the middle of a frame.
    #[error("unexpected end of stream")]
    UnexpectedEndOfStream,

    /// A payload exceeds the configured or protocol-level length limit.
    #[error("message too long")]
    TooLong,

    #[error("message invalid argument")]
    MsgInvalidArguments,

    #[error("message invalid read result")]
    MsgInvalidRead,

    #[error("message invalid write result")]
    MsgInvalidWrite,

    /// Read or write on a closed message reader/writer.
    #[error("message closed")]
    MsgClosed,

    #[error("unknown network {0}")]
    UnknownNetwork(String),

    #[error("invalid address {0}")]
    InvalidAddress(String),

    #[error("address {addr}: {err}")]
    AddressError { err: &'static str, addr: String },

    #[error("{op} {net}: {source}")]
    Op {
        op: &'static str,
        net: &'static str,
        #[source]
        source: Box<Error>,
    },

    /// Passthrough for errnos outside the mapped set.
    #[error("os error: {0}")]
    Os(Errno),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Maps a raw (positive) errno value into the taxonomy.
    pub fn from_errno(errno: i32) -> Self {
        Self::from(Errno::from_raw(errno))
    }

    /// Wraps an error with the failing operation and network, the way socket
    /// boundaries report dial/listen failures.
    pub(crate) fn op(op: &'static str, net: &'static str, source: Error) -> Self {
        Error::Op {
            op,
            net,
            source: Box::new(source),
        }
    }

    /// True for EAGAIN-class outcomes that a caller is expected to retry
    /// after the next readiness or completion event.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Error::TemporarilyUnavailable)
    }

    /// True for EINTR, which callers of low-level primitives may retry
    /// immediately.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::InterruptedSyscall)
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        match errno {
            Errno::EINTR => Error::InterruptedSyscall,
            Errno::EAGAIN => Error::TemporarilyUnavailable,
            Errno::EINPROGRESS => Error::InProgress,
            Errno::EFAULT => Error::FaultParams,
            Errno::EINVAL => Error::InvalidParam,
            Errno::EMFILE => Error::ProcessFileLimit,
            Errno::ENFILE => Error::SystemFileLimit,
            Errno::ENODEV => Error::NoDevice,
            Errno::ENOMEM => Error::NoAvailableMemory,
            Errno::EPERM => Error::NoPermission,
            Errno::EPIPE => Error::ClosedPipe,
            other => Error::Os(other),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        if let Some(errno) = err.raw_os_error() {
            return Error::from_errno(errno);
        }
        match err.kind() {
            io::ErrorKind::WouldBlock => Error::TemporarilyUnavailable,
            io::ErrorKind::Interrupted => Error::InterruptedSyscall,
            io::ErrorKind::UnexpectedEof => Error::UnexpectedEndOfStream,
            io::ErrorKind::BrokenPipe => Error::ClosedPipe,
            io::ErrorKind::WriteZero => Error::ShortWrite,
            io::ErrorKind::PermissionDenied => Error::NoPermission,
            io::ErrorKind::InvalidInput => Error::InvalidParam,
            _ => Error::Os(Errno::UnknownErrno),
        }
    }
}

// The framer sits behind `std::io` traits, so its callers may hand our
// errors back through an `io::Error`. Keep the round trip lossless for the
// kinds that matter to resumption.
impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match err {
            Error::TemporarilyUnavailable => io::ErrorKind::WouldBlock,
            Error::InterruptedSyscall => io::ErrorKind::Interrupted,
            Error::UnexpectedEndOfStream => io::ErrorKind::UnexpectedEof,
            Error::ClosedPipe => io::ErrorKind::BrokenPipe,
            Error::ShortWrite => io::ErrorKind::WriteZero,
            Error::NoPermission => io::ErrorKind::PermissionDenied,
            Error::InvalidParam => io::ErrorKind::InvalidInput,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::eintr(libc::EINTR, Error::InterruptedSyscall)]
    #[case::eagain(libc::EAGAIN, Error::TemporarilyUnavailable)]
    #[case::einprogress(libc::EINPROGRESS, Error::InProgress)]
    #[case::efault(libc::EFAULT, Error::FaultParams)]
    #[case::einval(libc::EINVAL, Error::InvalidParam)]
    #[case::emfile(libc::EMFILE, Error::ProcessFileLimit)]
    #[case::enfile(libc::ENFILE, Error::SystemFileLimit)]
    #[case::enodev(libc::ENODEV, Error::NoDevice)]
    #[case::enomem(libc::ENOMEM, Error::NoAvailableMemory)]
    #[case::eperm(libc::EPERM, Error::NoPermission)]
    fn test_errno_mapping(#[case] errno: i32, #[case] expected: Error) {
        assert_eq!(Error::from_errno(errno), expected);
    }

    #[test]
    fn test_unmapped_errno_passes_through() {
        assert_eq!(
            Error::from_errno(libc::ECONNRESET),
            Error::Os(Errno::ECONNRESET)
        );
    }

    #[test]
    fn test_io_error_round_trip() {
        let err = Error::TemporarilyUnavailable;
        let io_err = io::Error::from(err.clone());
        assert_eq!(io_err.kind(), io::ErrorKind::WouldBlock);
        assert_eq!(Error::from(io_err), err);
    }

    #[test]
    fn test_predicates() {
        assert!(Error::TemporarilyUnavailable.is_unavailable());
        assert!(Error::InterruptedSyscall.is_interrupted());
        assert!(!Error::EndOfStream.is_unavailable());
    }
}
