//! Descriptor records: a group of transfer slots behind one abstract descriptor.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use log::{debug, error, warn};

use super::cancel::CancellationStrategy;
use super::device::{Device, RawHandle};
use super::event::CompletionEvent;
use super::interest::{Descriptor, Interest};
use super::slot::{Completion, SlotState, TransferSlot, TransferStatus};
use crate::error::{Error, Result};
use crate::metrics::Stats;

/// Aggregate result of a fully retired descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Bytes moved across every slot of the batch.
    pub bytes: usize,
    /// A short transfer ended the batch early.
    pub aborted: bool,
    pub status: TransferStatus,
}

impl TransferOutcome {
    /// Byte count, or the first genuine transfer error.
    pub fn result(&self) -> Result<usize> {
        match self.status {
            TransferStatus::Failed(code) => Err(Error::Io(io::Error::from_raw_os_error(code))),
            _ => Ok(self.bytes),
        }
    }
}

/// What the waiter learned from draining a record.
#[derive(Debug)]
pub(crate) enum Drain {
    Ready { error: bool },
    /// First incomplete slot's completion handle.
    Waiting(CompletionEvent),
}

#[derive(Debug)]
pub struct DescriptorRecord {
    id: Descriptor,
    generation: u64,
    /// Borrowed primary handle; `None` for signal pipes.
    device: Option<Arc<dyn Device>>,
    /// Private handle transfers are submitted on when per-operation cancel is unavailable.
    duplicate: Option<Arc<dyn Device>>,
    interest: Interest,
    slots: Vec<TransferSlot>,
    retire_cursor: usize,
    aggregate_status: TransferStatus,
    aggregate_bytes: usize,
    aborted: bool,
    owner: ThreadId,
    /// Outstanding signals of a signal pipe; `None` for transfer descriptors.
    signals: Option<AtomicUsize>,
}

impl DescriptorRecord {
    pub(crate) fn new_transfer(
        id: Descriptor,
        generation: u64,
        device: Arc<dyn Device>,
        duplicate: Option<Arc<dyn Device>>,
        interest: Interest,
        slot_count: usize,
    ) -> Self {
        DescriptorRecord {
            id,
            generation,
            device: Some(device),
            duplicate,
            interest,
            slots: (0..slot_count).map(TransferSlot::new).collect(),
            retire_cursor: 0,
            aggregate_status: TransferStatus::Success,
            aggregate_bytes: 0,
            aborted: false,
            owner: thread::current().id(),
            signals: None,
        }
    }

    pub(crate) fn new_pipe(id: Descriptor, generation: u64) -> Self {
        DescriptorRecord {
            id,
            generation,
            device: None,
            duplicate: None,
            interest: Interest::ReadWrite,
            slots: vec![TransferSlot::new(0)],
            retire_cursor: 0,
            aggregate_status: TransferStatus::Success,
            aggregate_bytes: 0,
            aborted: false,
            owner: thread::current().id(),
            signals: Some(AtomicUsize::new(0)),
        }
    }

    pub fn id(&self) -> Descriptor {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }

    pub fn is_signal_pipe(&self) -> bool {
        self.signals.is_some()
    }

    pub fn owner_thread(&self) -> ThreadId {
        self.owner
    }

    pub fn slots(&self) -> &[TransferSlot] {
        &self.slots
    }

    pub fn retire_cursor(&self) -> usize {
        self.retire_cursor
    }

    pub fn is_drained(&self) -> bool {
        self.retire_cursor == self.slots.len()
    }

    pub fn aborted(&self) -> bool {
        self.aborted
    }

    pub fn aggregate_bytes(&self) -> usize {
        self.aggregate_bytes
    }

    pub fn has_duplicate(&self) -> bool {
        self.duplicate.is_some()
    }

    /// Handle transfers must be submitted on.
    pub fn io_handle(&self) -> Option<&Arc<dyn Device>> {
        self.duplicate.as_ref().or(self.device.as_ref())
    }

    fn io_raw_handle(&self) -> RawHandle {
        self.io_handle().map(|d| d.raw_handle()).unwrap_or(0)
    }

    pub(crate) fn arm(&mut self, index: usize, requested: usize) -> Result<Completion> {
        if self.is_signal_pipe() {
            return Err(Error::InvalidArgument("signal pipes carry no transfers"));
        }
        if index >= self.slots.len() {
            return Err(Error::InvalidArgument("slot index out of range"));
        }
        if index < self.retire_cursor {
            return Err(Error::InvalidArgument("slot already retired in this batch"));
        }
        let io_handle = self.io_raw_handle();
        self.slots[index].arm(requested, io_handle)
    }

    /// Start a new batch: clear the retire cursor, aggregates and every slot.
    ///
    /// Only a fully retired batch is replaced; results not yet retired and completion handles a
    /// waiter may be blocked on stay in place. A record with nothing armed is left as it is.
    pub(crate) fn rearm(&mut self) -> Result<()> {
        if self.is_signal_pipe() {
            return Err(Error::InvalidArgument("signal pipes carry no transfers"));
        }
        if !self.is_drained() {
            if self.slots.iter().all(|s| matches!(s.completion().state(), SlotState::Idle)) {
                return Ok(());
            }
            return Err(Error::Busy);
        }
        self.slots = (0..self.slots.len()).map(TransferSlot::new).collect();
        self.retire_cursor = 0;
        self.aggregate_status = TransferStatus::Success;
        self.aggregate_bytes = 0;
        self.aborted = false;
        Ok(())
    }

    pub fn outcome(&self) -> Option<TransferOutcome> {
        if self.is_signal_pipe() || !self.is_drained() {
            return None;
        }
        Some(TransferOutcome { bytes: self.aggregate_bytes, aborted: self.aborted, status: self.aggregate_status })
    }

    /// Retire completed slots in submission order starting at the retire cursor.
    pub(crate) fn drain(&mut self, strategy: CancellationStrategy, stats: &Stats) -> Result<Drain> {
        if self.is_signal_pipe() {
            let event = self.slots[0].completion().event();
            return Ok(if event.is_set() { Drain::Ready { error: false } } else { Drain::Waiting(event.clone()) });
        }

        while self.retire_cursor < self.slots.len() {
            let completion = self.slots[self.retire_cursor].completion().clone();
            // Event first: a completion updates the state before it signals.
            let signaled = completion.event().is_set();
            match completion.state() {
                SlotState::Idle | SlotState::Pending { .. } => {
                    if signaled {
                        error!("{}: slot {} signaled while still pending", self.id, self.retire_cursor);
                        return Err(Error::Internal("completion signaled with transfer still pending"));
                    }
                    return Ok(Drain::Waiting(completion.event().clone()));
                }
                SlotState::Complete { requested, transferred, status } => {
                    self.retire(requested, transferred, status, strategy, stats);
                }
            }
        }
        Ok(Drain::Ready { error: self.aggregate_status.is_failure() })
    }

    fn retire(
        &mut self,
        requested: usize,
        transferred: usize,
        status: TransferStatus,
        strategy: CancellationStrategy,
        stats: &Stats,
    ) {
        let index = self.retire_cursor;
        self.aggregate_bytes += transferred;
        self.aggregate_status = match (self.aggregate_status, status) {
            (TransferStatus::Failed(code), _) => TransferStatus::Failed(code),
            (_, TransferStatus::Failed(code)) => TransferStatus::Failed(code),
            (TransferStatus::Success, other) => other,
            (current, _) => current,
        };
        self.retire_cursor += 1;

        if transferred == requested {
            return;
        }
        self.slots[index].set_short_transfer();
        if self.aborted {
            return;
        }
        self.aborted = true;
        stats.inc_short_transfers();
        debug!("{}: slot {} short transfer ({} of {} bytes), aborting batch", self.id, index, transferred, requested);

        let rest: Vec<Completion> = self.slots[index + 1..].iter().map(|s| s.completion().clone()).collect();
        let Some(io_handle) = self.io_handle() else { return };
        match strategy.cancel(io_handle.as_ref(), &rest) {
            Ok(n) => stats.add_cancels_requested(n as u64),
            Err(e) => {
                stats.inc_cancels_failed();
                warn!("{}: cancelling after short transfer failed: {}", self.id, e);
            }
        }
    }

    /// Request cancellation of one slot, or of every slot not yet retired.
    pub(crate) fn cancel(&self, strategy: CancellationStrategy, slot: Option<usize>) -> Result<usize> {
        let Some(io_handle) = self.io_handle() else {
            return Ok(0);
        };
        let targets: Vec<Completion> = match slot {
            Some(i) => {
                let s = self.slots.get(i).ok_or(Error::InvalidArgument("slot index out of range"))?;
                vec![s.completion().clone()]
            }
            None => self.slots[self.retire_cursor..].iter().map(|s| s.completion().clone()).collect(),
        };
        strategy.cancel(io_handle.as_ref(), &targets)
    }

    /// Completions still in flight, in submission order.
    pub(crate) fn pending_completions(&self) -> Vec<Completion> {
        self.slots.iter().filter(|s| s.is_pending()).map(|s| s.completion().clone()).collect()
    }

    // ----- signal pipe -----

    pub(crate) fn signal_event(&self) -> Option<&CompletionEvent> {
        self.signals.as_ref().map(|_| self.slots[0].completion().event())
    }

    pub(crate) fn signal(&self) -> Result<()> {
        let counter = self.signals.as_ref().ok_or(Error::InvalidDescriptor)?;
        counter.fetch_add(1, Ordering::SeqCst);
        self.slots[0].completion().event().set();
        Ok(())
    }

    /// Take one outstanding signal. The handle goes back to non-signaled with the last one.
    pub(crate) fn try_consume(&self) -> Result<bool> {
        let counter = self.signals.as_ref().ok_or(Error::InvalidDescriptor)?;
        let pending = counter.load(Ordering::SeqCst);
        if pending == 0 {
            return Ok(false);
        }
        counter.store(pending - 1, Ordering::SeqCst);
        if pending == 1 {
            self.slots[0].completion().event().reset();
        }
        Ok(true)
    }

    pub fn pending_signals(&self) -> usize {
        self.signals.as_ref().map(|c| c.load(Ordering::SeqCst)).unwrap_or(0)
    }
}
