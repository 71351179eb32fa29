//! Best-effort cancellation of in-flight transfers.
//!
//! The strategy is chosen once per table from a capability probe. Each request then walks the
//! policy from the chosen strategy downwards, first applicable primitive wins:
//!
//! 1. per-operation cancel of every incomplete transfer,
//! 2. "cancel everything this thread started on this handle", only from the submitting thread,
//! 3. nothing: log and fail soft. Bounding the wait (endpoint reset and the like) is then up to
//!    the caller.
//!
//! Cancellation is a request. The transfer still has to reach its terminal cancelled state
//! before its resources can be reclaimed.

use std::io::ErrorKind;
use std::str::FromStr;
use std::thread;

use log::{debug, warn};

use super::device::Device;
use super::slot::Completion;
use crate::error::{Error, Result};

/// Cancellation primitives offered by the host platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub per_operation_cancel: bool,
    pub thread_cancel: bool,
}

impl Capabilities {
    /// Probe the running platform.
    #[cfg(windows)]
    pub fn host() -> Self {
        type HMODULE = *mut core::ffi::c_void;

        #[link(name = "kernel32")]
        extern "system" {
            fn GetModuleHandleW(lpModuleName: *const u16) -> HMODULE;
            fn GetProcAddress(hModule: HMODULE, lpProcName: *const u8) -> *mut core::ffi::c_void;
        }

        let name: Vec<u16> = "kernel32.dll".encode_utf16().chain(Some(0)).collect();
        // CancelIoEx is missing before Vista; CancelIo has always been there.
        let per_operation_cancel = unsafe {
            let module = GetModuleHandleW(name.as_ptr());
            !module.is_null() && !GetProcAddress(module, b"CancelIoEx\0".as_ptr()).is_null()
        };
        Capabilities { per_operation_cancel, thread_cancel: true }
    }

    /// Probe the running platform.
    #[cfg(not(windows))]
    pub fn host() -> Self {
        Capabilities { per_operation_cancel: true, thread_cancel: true }
    }
}

/// Configured preference; `Auto` defers to the capability probe.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StrategyChoice {
    #[default]
    Auto,
    PerOperation,
    ThreadScoped,
    DeviceAbort,
}

impl FromStr for StrategyChoice {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        match s {
            "auto" => Ok(StrategyChoice::Auto),
            "per_operation" => Ok(StrategyChoice::PerOperation),
            "thread" => Ok(StrategyChoice::ThreadScoped),
            "abort" => Ok(StrategyChoice::DeviceAbort),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancellationStrategy {
    PerOperation,
    ThreadScoped,
    DeviceAbort,
}

impl CancellationStrategy {
    pub fn probe(choice: StrategyChoice) -> Self {
        match choice {
            StrategyChoice::Auto => Self::from_capabilities(Capabilities::host()),
            StrategyChoice::PerOperation => CancellationStrategy::PerOperation,
            StrategyChoice::ThreadScoped => CancellationStrategy::ThreadScoped,
            StrategyChoice::DeviceAbort => CancellationStrategy::DeviceAbort,
        }
    }

    pub fn from_capabilities(caps: Capabilities) -> Self {
        if caps.per_operation_cancel {
            CancellationStrategy::PerOperation
        } else if caps.thread_cancel {
            CancellationStrategy::ThreadScoped
        } else {
            CancellationStrategy::DeviceAbort
        }
    }

    /// Without per-operation cancel, transfers go through a private duplicate so a thread-scoped
    /// cancel only reaches this descriptor's transfers.
    pub fn needs_duplicate(self) -> bool {
        self != CancellationStrategy::PerOperation
    }

    /// Request cancellation of `pending` transfers submitted on `io_handle`.
    ///
    /// Returns how many transfers a cancellation was requested for. Transfers that already
    /// finished are skipped, so cancelling a fully completed set is a no-op returning 0.
    pub(crate) fn cancel(self, io_handle: &dyn Device, pending: &[Completion]) -> Result<usize> {
        let mut remaining: Vec<&Completion> = pending.iter().filter(|c| c.is_pending()).collect();
        if remaining.is_empty() {
            return Ok(0);
        }
        let mut requested = 0;

        if self == CancellationStrategy::PerOperation {
            let mut unsupported = false;
            for transfer in &remaining {
                match io_handle.cancel_transfer(transfer) {
                    Ok(()) => requested += 1,
                    // Finished between the pending check and the cancel.
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) if e.kind() == ErrorKind::Unsupported => {
                        unsupported = true;
                        break;
                    }
                    Err(e) => return Err(Error::Io(e)),
                }
            }
            if !unsupported {
                return Ok(requested);
            }
            debug!("per-operation cancel unsupported on handle {:#x}, trying thread-scoped", io_handle.raw_handle());
            remaining.retain(|c| c.is_pending());
        }

        if self != CancellationStrategy::DeviceAbort {
            let me = thread::current().id();
            let (mine, foreign): (Vec<&Completion>, Vec<&Completion>) =
                remaining.into_iter().partition(|c| c.submitter() == Some(me));
            if !mine.is_empty() {
                match io_handle.cancel_thread_transfers() {
                    Ok(()) => requested += mine.len(),
                    Err(e) if e.kind() == ErrorKind::Unsupported => {
                        warn!("no cancellation primitive for handle {:#x}", io_handle.raw_handle());
                        return Err(Error::CancelUnavailable);
                    }
                    Err(e) => return Err(Error::Io(e)),
                }
            }
            if foreign.is_empty() {
                return Ok(requested);
            }
            warn!(
                "unable to cancel {} transfer(s) started from another thread on handle {:#x}",
                foreign.len(),
                io_handle.raw_handle()
            );
            return Err(Error::CancelUnavailable);
        }

        warn!(
            "cancellation unavailable for {} transfer(s) on handle {:#x}; device abort required",
            remaining.len(),
            io_handle.raw_handle()
        );
        Err(Error::CancelUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::loopback::{LoopbackCaps, LoopbackDevice};
    use crate::os::slot::{TransferSlot, TransferStatus};

    fn armed(dev: &LoopbackDevice, n: usize) -> (Vec<TransferSlot>, Vec<Completion>) {
        let mut slots: Vec<TransferSlot> = (0..n).map(TransferSlot::new).collect();
        let completions: Vec<Completion> = slots
            .iter_mut()
            .map(|s| {
                let c = s.arm(32, dev.raw_handle()).unwrap();
                dev.submit(c.clone());
                c
            })
            .collect();
        (slots, completions)
    }

    #[test]
    fn probe_prefers_finest_primitive() {
        let all = Capabilities { per_operation_cancel: true, thread_cancel: true };
        let thread_only = Capabilities { per_operation_cancel: false, thread_cancel: true };
        let none = Capabilities { per_operation_cancel: false, thread_cancel: false };
        assert_eq!(CancellationStrategy::from_capabilities(all), CancellationStrategy::PerOperation);
        assert_eq!(CancellationStrategy::from_capabilities(thread_only), CancellationStrategy::ThreadScoped);
        assert_eq!(CancellationStrategy::from_capabilities(none), CancellationStrategy::DeviceAbort);
        assert!(!CancellationStrategy::PerOperation.needs_duplicate());
        assert!(CancellationStrategy::ThreadScoped.needs_duplicate());
    }

    #[test]
    fn forced_choice_skips_probe() {
        assert_eq!(CancellationStrategy::probe(StrategyChoice::DeviceAbort), CancellationStrategy::DeviceAbort);
        assert_eq!("thread".parse::<StrategyChoice>(), Ok(StrategyChoice::ThreadScoped));
        assert!("sometimes".parse::<StrategyChoice>().is_err());
    }

    #[test]
    fn per_operation_cancels_each_pending() {
        let dev = LoopbackDevice::new(LoopbackCaps::default());
        let (_slots, completions) = armed(&dev, 3);
        dev.complete_next_full();

        let n = CancellationStrategy::PerOperation.cancel(dev.as_ref(), &completions).unwrap();
        assert_eq!(n, 2);
        assert_eq!(completions[0].status(), TransferStatus::Success);
        assert_eq!(completions[1].status(), TransferStatus::Cancelled);
        assert_eq!(completions[2].status(), TransferStatus::Cancelled);
    }

    #[test]
    fn completed_set_is_noop() {
        let dev = LoopbackDevice::new(LoopbackCaps::default());
        let (_slots, completions) = armed(&dev, 2);
        dev.complete_next_full();
        dev.complete_next_full();
        assert_eq!(CancellationStrategy::DeviceAbort.cancel(dev.as_ref(), &completions).unwrap(), 0);
    }

    #[test]
    fn falls_back_to_thread_scoped() {
        let caps = LoopbackCaps { per_operation_cancel: false, ..LoopbackCaps::default() };
        let dev = LoopbackDevice::new(caps);
        let (_slots, completions) = armed(&dev, 2);
        let n = CancellationStrategy::PerOperation.cancel(dev.as_ref(), &completions).unwrap();
        assert_eq!(n, 2);
        assert!(completions.iter().all(|c| c.status() == TransferStatus::Cancelled));
    }

    #[test]
    fn foreign_thread_fails_soft() {
        let caps = LoopbackCaps { per_operation_cancel: false, ..LoopbackCaps::default() };
        let dev = LoopbackDevice::new(caps);
        let (_slots, completions) = armed(&dev, 1);
        let dev2 = dev.clone();
        let result = thread::spawn(move || CancellationStrategy::ThreadScoped.cancel(dev2.as_ref(), &completions))
            .join()
            .unwrap();
        assert!(matches!(result, Err(Error::CancelUnavailable)));
        assert_eq!(dev.in_flight(), 1);
    }

    #[test]
    fn abort_strategy_only_logs() {
        let dev = LoopbackDevice::new(LoopbackCaps::default());
        let (_slots, completions) = armed(&dev, 1);
        let result = CancellationStrategy::DeviceAbort.cancel(dev.as_ref(), &completions);
        assert!(matches!(result, Err(Error::CancelUnavailable)));
        assert!(completions[0].is_pending());
    }
}
