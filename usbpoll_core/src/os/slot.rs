//! Transfer slots: one outstanding asynchronous operation and its completion handle.
//!
//! A `TransferSlot` is owned by its descriptor record. The `Completion` it hands out is the shared
//! half the OS stack (or the loopback endpoint) holds on to while the transfer is in flight, and is
//! the only thing that may move the slot into a terminal state.

use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;

use super::device::RawHandle;
use super::event::CompletionEvent;
use crate::error::{Error, Result};

/// Result code of one transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Success,
    /// Terminal state of a transfer that was cancelled before it finished.
    Cancelled,
    /// OS error code.
    Failed(i32),
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TransferStatus::Pending)
    }

    /// A genuine failure, as opposed to a cancellation artifact.
    pub fn is_failure(self) -> bool {
        matches!(self, TransferStatus::Failed(_))
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum SlotState {
    Idle,
    Pending {
        requested: usize,
        submitter: ThreadId,
        io_handle: RawHandle,
    },
    Complete {
        requested: usize,
        transferred: usize,
        status: TransferStatus,
    },
}

#[derive(Debug)]
struct Shared {
    index: usize,
    state: Mutex<SlotState>,
    event: CompletionEvent,
}

/// Shared completion state of a slot, handed to whoever performs the transfer.
#[derive(Clone, Debug)]
pub struct Completion {
    shared: Arc<Shared>,
}

impl Completion {
    fn new(index: usize) -> Self {
        Completion {
            shared: Arc::new(Shared {
                index,
                state: Mutex::new(SlotState::Idle),
                event: CompletionEvent::new(),
            }),
        }
    }

    /// Finish the transfer and signal its completion handle.
    ///
    /// Only the first completion of an armed transfer counts; later calls (for example a cancel
    /// racing a normal completion) return false and change nothing.
    pub fn complete(&self, transferred: usize, status: TransferStatus) -> bool {
        debug_assert!(status.is_terminal());
        {
            let mut state = self.shared.state.lock();
            let requested = match *state {
                SlotState::Pending { requested, .. } => requested,
                _ => return false,
            };
            *state = SlotState::Complete { requested, transferred, status };
        }
        self.shared.event.set();
        true
    }

    /// Complete as cancelled with nothing transferred.
    pub fn cancel(&self) -> bool {
        self.complete(0, TransferStatus::Cancelled)
    }

    /// Block until the slot reaches a terminal state. Returns false on timeout.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        self.shared.event.wait(timeout)
    }

    pub fn index(&self) -> usize {
        self.shared.index
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.shared.state.lock(), SlotState::Pending { .. })
    }

    pub fn status(&self) -> TransferStatus {
        match *self.shared.state.lock() {
            SlotState::Complete { status, .. } => status,
            _ => TransferStatus::Pending,
        }
    }

    pub fn requested(&self) -> usize {
        match *self.shared.state.lock() {
            SlotState::Idle => 0,
            SlotState::Pending { requested, .. } | SlotState::Complete { requested, .. } => requested,
        }
    }

    pub fn transferred(&self) -> usize {
        match *self.shared.state.lock() {
            SlotState::Complete { transferred, .. } => transferred,
            _ => 0,
        }
    }

    /// Thread that armed the in-flight transfer.
    pub fn submitter(&self) -> Option<ThreadId> {
        match *self.shared.state.lock() {
            SlotState::Pending { submitter, .. } => Some(submitter),
            _ => None,
        }
    }

    /// Handle the in-flight transfer was submitted on.
    pub fn io_handle(&self) -> Option<RawHandle> {
        match *self.shared.state.lock() {
            SlotState::Pending { io_handle, .. } => Some(io_handle),
            _ => None,
        }
    }

    pub fn ptr_eq(&self, other: &Completion) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub(crate) fn event(&self) -> &CompletionEvent {
        &self.shared.event
    }

    pub(crate) fn state(&self) -> SlotState {
        *self.shared.state.lock()
    }
}

/// One outstanding asynchronous operation and its bookkeeping.
#[derive(Debug)]
pub struct TransferSlot {
    completion: Completion,
    short_transfer: bool,
}

impl TransferSlot {
    pub(crate) fn new(index: usize) -> Self {
        TransferSlot { completion: Completion::new(index), short_transfer: false }
    }

    /// Mark the slot in flight on `io_handle`. The completion handle is reset before the new
    /// transfer becomes visible.
    ///
    /// Only an idle slot can be armed. A finished transfer stays in place until its record retires
    /// it and starts a new batch with fresh slots.
    pub(crate) fn arm(&mut self, requested: usize, io_handle: RawHandle) -> Result<Completion> {
        let mut state = self.completion.shared.state.lock();
        if !matches!(*state, SlotState::Idle) {
            return Err(Error::Busy);
        }
        self.completion.shared.event.reset();
        *state = SlotState::Pending { requested, submitter: thread::current().id(), io_handle };
        self.short_transfer = false;
        Ok(self.completion.clone())
    }

    pub fn completion(&self) -> &Completion {
        &self.completion
    }

    pub fn is_pending(&self) -> bool {
        self.completion.is_pending()
    }

    pub fn short_transfer(&self) -> bool {
        self.short_transfer
    }

    pub(crate) fn set_short_transfer(&mut self) {
        self.short_transfer = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_completion_wins() {
        let mut slot = TransferSlot::new(0);
        let c = slot.arm(64, 7).unwrap();
        assert!(c.is_pending());
        assert_eq!(c.submitter(), Some(thread::current().id()));
        assert_eq!(c.io_handle(), Some(7));

        assert!(c.complete(64, TransferStatus::Success));
        assert!(!c.cancel());
        assert_eq!(c.status(), TransferStatus::Success);
        assert_eq!(c.transferred(), 64);
        assert!(c.wait(Some(Duration::ZERO)));
    }

    #[test]
    fn only_idle_slot_can_be_armed() {
        let mut slot = TransferSlot::new(1);
        let c = slot.arm(8, 0).unwrap();
        assert!(matches!(slot.arm(8, 0), Err(Error::Busy)));
        c.complete(8, TransferStatus::Success);
        assert!(matches!(slot.arm(16, 0), Err(Error::Busy)));
        assert_eq!(c.transferred(), 8);
        assert_eq!(c.requested(), 8);
        assert!(c.wait(Some(Duration::ZERO)));
    }

    #[test]
    fn idle_slot_cannot_be_completed() {
        let slot = TransferSlot::new(2);
        assert!(!slot.completion().complete(4, TransferStatus::Success));
        assert_eq!(slot.completion().status(), TransferStatus::Pending);
    }
}
