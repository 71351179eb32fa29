//! Native device handles as seen by the readiness layer.
//!
//! The layer never opens or submits I/O on a device itself. It borrows a handle from the protocol
//! layer, optionally duplicates it so cancellation can be targeted from another thread, and asks it
//! to cancel transfers. Whatever closes the handle is the handle's own `Drop`, so the primary is
//! closed only once its last owner lets go.

use std::fmt;
use std::io::{Error, ErrorKind, Result};
use std::sync::Arc;

use super::slot::Completion;

/// Pointer-sized opaque OS handle value.
pub type RawHandle = usize;

pub trait Device: Send + Sync + fmt::Debug {
    fn raw_handle(&self) -> RawHandle;

    /// Request cancellation of one in-flight transfer.
    ///
    /// `Unsupported` means the platform has no per-operation cancel; `NotFound` means the transfer
    /// already finished.
    fn cancel_transfer(&self, transfer: &Completion) -> Result<()> {
        let _ = transfer;
        Err(Error::new(ErrorKind::Unsupported, "per-operation cancel unavailable"))
    }

    /// Request cancellation of every transfer the calling thread started on this handle.
    fn cancel_thread_transfers(&self) -> Result<()> {
        Err(Error::new(ErrorKind::Unsupported, "thread-scoped cancel unavailable"))
    }

    /// Open a second handle to the same device. Dropping the duplicate closes it.
    fn duplicate(&self) -> Result<Arc<dyn Device>>;
}

#[cfg(unix)]
pub use self::fd::FdDevice;

#[cfg(unix)]
mod fd {
    use super::*;
    use std::os::unix::io::RawFd;

    /// Plain file descriptor. Offers no cancellation primitive of its own.
    #[derive(Debug)]
    pub struct FdDevice {
        fd: RawFd,
        owned: bool,
    }

    impl FdDevice {
        /// Wrap a descriptor owned by the caller; it is never closed by this wrapper.
        pub fn borrowed(fd: RawFd) -> Result<Self> {
            let res = unsafe { libc::fcntl(fd, libc::F_GETFD) };
            if res < 0 {
                return Err(Error::last_os_error());
            }
            Ok(FdDevice { fd, owned: false })
        }

        pub fn is_owned(&self) -> bool {
            self.owned
        }
    }

    impl Device for FdDevice {
        fn raw_handle(&self) -> RawHandle {
            self.fd as RawHandle
        }

        fn duplicate(&self) -> Result<Arc<dyn Device>> {
            let fd = unsafe { libc::fcntl(self.fd, libc::F_DUPFD_CLOEXEC, 0) };
            if fd < 0 {
                return Err(Error::last_os_error());
            }
            Ok(Arc::new(FdDevice { fd, owned: true }))
        }
    }

    impl Drop for FdDevice {
        fn drop(&mut self) {
            if self.owned {
                unsafe { libc::close(self.fd) };
            }
        }
    }
}
