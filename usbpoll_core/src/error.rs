//! Error taxonomy of the readiness layer and its POSIX errno mapping.

use std::io;

use log::Level;
use thiserror::Error;

use crate::os::interest::Interest;

/// Errors returned by descriptor table, waiter and signal pipe operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Unknown, freed or recycled descriptor id.
    #[error("invalid descriptor")]
    InvalidDescriptor,
    /// The request direction is not part of the descriptor's direction mask.
    #[error("descriptor is not open for {0:?}")]
    AccessDenied(Interest),
    /// A descriptor was registered while waiting, or the wait was explicitly woken.
    #[error("interrupted")]
    Interrupted,
    /// A bounded wait on a signal pipe elapsed.
    #[error("timed out")]
    TimedOut,
    /// A transfer failed for a reason other than cancellation.
    #[error("I/O failure: {0}")]
    Io(#[from] io::Error),
    /// Every table entry is in use.
    #[error("descriptor table exhausted")]
    Exhausted,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// A slot is still in flight.
    #[error("transfer still in flight")]
    Busy,
    /// No cancellation primitive applies from this thread; the caller must bound the wait.
    #[error("cancellation unavailable from this thread")]
    CancelUnavailable,
    /// Invariant violation. Always a bug.
    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl Error {
    /// Map error to the closest POSIX errno value.
    pub fn errno(&self) -> i32 {
        match self {
            Error::InvalidDescriptor => libc::EBADF,
            Error::AccessDenied(_) => libc::EACCES,
            Error::Interrupted => libc::EINTR,
            Error::TimedOut => libc::ETIMEDOUT,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::Exhausted => libc::EMFILE,
            Error::InvalidArgument(_) => libc::EINVAL,
            Error::Busy => libc::EBUSY,
            Error::CancelUnavailable => libc::ENOTSUP,
            Error::Internal(_) => libc::EFAULT,
        }
    }

    /// Map error to the level it should be logged at.
    pub fn log_level(&self) -> Level {
        match self {
            Error::Interrupted | Error::TimedOut => Level::Debug,
            Error::InvalidDescriptor | Error::AccessDenied(_) | Error::InvalidArgument(_) => Level::Info,
            Error::Exhausted | Error::Busy | Error::CancelUnavailable | Error::Io(_) => Level::Warn,
            Error::Internal(_) => Level::Error,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(Error::InvalidDescriptor.errno(), libc::EBADF);
        assert_eq!(Error::AccessDenied(Interest::Writable).errno(), libc::EACCES);
        assert_eq!(Error::Interrupted.errno(), libc::EINTR);
        assert_eq!(Error::TimedOut.errno(), libc::ETIMEDOUT);
        assert_eq!(Error::Io(io::Error::new(io::ErrorKind::Other, "x")).errno(), libc::EIO);
        assert_eq!(Error::Io(io::Error::from_raw_os_error(libc::EPIPE)).errno(), libc::EPIPE);
    }

    #[test]
    fn internal_logs_loudly() {
        assert_eq!(Error::Internal("x").log_level(), Level::Error);
        assert_eq!(Error::Interrupted.log_level(), Level::Debug);
    }
}
