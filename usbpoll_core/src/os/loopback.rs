//! In-process simulated USB endpoint.
//!
//! `LoopbackDevice` stands in for the OS USB stack: the protocol side submits armed transfers to
//! it, and a driver (test, fuzz target or soak thread) completes them in submission order. It
//! honours cancellation according to the capabilities it was created with, which makes every
//! branch of the cancellation policy reachable without real hardware.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use super::device::{Device, RawHandle};
use super::slot::{Completion, TransferStatus};

static NEXT_HANDLE: AtomicUsize = AtomicUsize::new(0x1000);

/// Cancellation primitives a loopback endpoint exposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoopbackCaps {
    pub per_operation_cancel: bool,
    pub thread_cancel: bool,
    /// Cancelled transfers reach their terminal state only after this delay.
    pub cancel_delay: Option<Duration>,
}

impl Default for LoopbackCaps {
    fn default() -> Self {
        LoopbackCaps { per_operation_cancel: true, thread_cancel: true, cancel_delay: None }
    }
}

#[derive(Debug, Default)]
struct Endpoint {
    in_flight: Mutex<VecDeque<Completion>>,
    open_duplicates: AtomicUsize,
}

impl Endpoint {
    fn next_pending(&self) -> Option<Completion> {
        let mut queue = self.in_flight.lock();
        while let Some(front) = queue.pop_front() {
            if front.is_pending() {
                return Some(front);
            }
        }
        None
    }
}

#[derive(Debug)]
pub struct LoopbackDevice {
    handle: RawHandle,
    caps: LoopbackCaps,
    endpoint: Arc<Endpoint>,
    is_duplicate: bool,
}

impl LoopbackDevice {
    pub fn new(caps: LoopbackCaps) -> Arc<Self> {
        Arc::new(LoopbackDevice {
            handle: NEXT_HANDLE.fetch_add(1, Ordering::Relaxed),
            caps,
            endpoint: Arc::new(Endpoint::default()),
            is_duplicate: false,
        })
    }

    /// Hand an armed transfer to the endpoint.
    pub fn submit(&self, transfer: Completion) {
        self.endpoint.in_flight.lock().push_back(transfer);
    }

    /// Complete the oldest in-flight transfer with `transferred` bytes.
    pub fn complete_next(&self, transferred: usize) -> Option<Completion> {
        let next = self.endpoint.next_pending()?;
        next.complete(transferred, TransferStatus::Success);
        Some(next)
    }

    /// Complete the oldest in-flight transfer with every requested byte.
    pub fn complete_next_full(&self) -> Option<Completion> {
        let next = self.endpoint.next_pending()?;
        next.complete(next.requested(), TransferStatus::Success);
        Some(next)
    }

    pub fn fail_next(&self, os_error: i32) -> Option<Completion> {
        let next = self.endpoint.next_pending()?;
        next.complete(0, TransferStatus::Failed(os_error));
        Some(next)
    }

    /// Number of submitted transfers that have not reached a terminal state.
    pub fn in_flight(&self) -> usize {
        self.endpoint.in_flight.lock().iter().filter(|c| c.is_pending()).count()
    }

    /// Duplicates of this endpoint that are still open.
    pub fn open_duplicates(&self) -> usize {
        self.endpoint.open_duplicates.load(Ordering::SeqCst)
    }

    fn cancel_later(&self, transfers: Vec<Completion>) {
        match self.caps.cancel_delay {
            None => {
                for t in transfers {
                    t.cancel();
                }
            }
            Some(delay) => {
                thread::spawn(move || {
                    thread::sleep(delay);
                    for t in transfers {
                        t.cancel();
                    }
                });
            }
        }
    }
}

impl Device for LoopbackDevice {
    fn raw_handle(&self) -> RawHandle {
        self.handle
    }

    fn cancel_transfer(&self, transfer: &Completion) -> std::io::Result<()> {
        if !self.caps.per_operation_cancel {
            return Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "no per-operation cancel"));
        }
        let found = self
            .endpoint
            .in_flight
            .lock()
            .iter()
            .any(|c| c.ptr_eq(transfer) && c.is_pending());
        if !found {
            return Err(std::io::Error::from(std::io::ErrorKind::NotFound));
        }
        self.cancel_later(vec![transfer.clone()]);
        Ok(())
    }

    fn cancel_thread_transfers(&self) -> std::io::Result<()> {
        if !self.caps.thread_cancel {
            return Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "no thread-scoped cancel"));
        }
        let me = thread::current().id();
        let mine: Vec<Completion> = self
            .endpoint
            .in_flight
            .lock()
            .iter()
            .filter(|c| c.submitter() == Some(me) && c.io_handle() == Some(self.handle))
            .cloned()
            .collect();
        self.cancel_later(mine);
        Ok(())
    }

    fn duplicate(&self) -> std::io::Result<Arc<dyn Device>> {
        self.endpoint.open_duplicates.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(LoopbackDevice {
            handle: NEXT_HANDLE.fetch_add(1, Ordering::Relaxed),
            caps: self.caps,
            endpoint: Arc::clone(&self.endpoint),
            is_duplicate: true,
        }))
    }
}

impl Drop for LoopbackDevice {
    fn drop(&mut self) {
        if self.is_duplicate {
            self.endpoint.open_duplicates.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::slot::TransferSlot;

    #[test]
    fn completes_in_submission_order() {
        let dev = LoopbackDevice::new(LoopbackCaps::default());
        let mut a = TransferSlot::new(0);
        let mut b = TransferSlot::new(1);
        dev.submit(a.arm(10, dev.raw_handle()).unwrap());
        dev.submit(b.arm(20, dev.raw_handle()).unwrap());
        assert_eq!(dev.in_flight(), 2);

        assert_eq!(dev.complete_next_full().unwrap().index(), 0);
        assert_eq!(dev.complete_next(5).unwrap().index(), 1);
        assert_eq!(b.completion().transferred(), 5);
        assert!(dev.complete_next(1).is_none());
    }

    #[test]
    fn thread_cancel_only_touches_own_handle() {
        let dev = LoopbackDevice::new(LoopbackCaps::default());
        let dup = dev.duplicate().unwrap();
        assert_eq!(dev.open_duplicates(), 1);

        let mut on_primary = TransferSlot::new(0);
        let mut on_dup = TransferSlot::new(1);
        dev.submit(on_primary.arm(8, dev.raw_handle()).unwrap());
        dev.submit(on_dup.arm(8, dup.raw_handle()).unwrap());

        dup.cancel_thread_transfers().unwrap();
        assert_eq!(on_dup.completion().status(), TransferStatus::Cancelled);
        assert!(on_primary.is_pending());

        drop(dup);
        assert_eq!(dev.open_duplicates(), 0);
    }

    #[test]
    fn finished_transfer_is_not_found() {
        let dev = LoopbackDevice::new(LoopbackCaps::default());
        let mut slot = TransferSlot::new(0);
        let c = slot.arm(4, dev.raw_handle()).unwrap();
        dev.submit(c.clone());
        dev.complete_next_full();
        let err = dev.cancel_transfer(&c).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
