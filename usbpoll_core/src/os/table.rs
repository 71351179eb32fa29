//! Fixed-capacity table mapping abstract descriptors to their records.
//!
//! Every entry has its own lock and locks are only ever taken one at a time: no operation holds
//! two entries, so there is no cross-descriptor lock order to get wrong. The table also owns the
//! sticky "new descriptor" event that allocators set and `poll` waits on, which closes the race
//! between a waiter taking its snapshot and a descriptor being registered behind its back.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use super::cancel::CancellationStrategy;
use super::device::Device;
use super::event::{timeout_from_ms, CompletionEvent};
use super::interest::{Descriptor, Interest};
use super::record::{DescriptorRecord, TransferOutcome};
use super::slot::Completion;
use crate::config::PollConfig;
use crate::error::{Error, Result};
use crate::metrics::Stats;

#[derive(Debug, Default)]
struct Entry {
    /// Unlocked hint for the allocation scan; the record under the lock is authoritative.
    occupied: AtomicBool,
    record: Mutex<Option<DescriptorRecord>>,
}

#[derive(Debug)]
pub struct DescriptorTable {
    entries: Box<[Entry]>,
    new_descriptor: CompletionEvent,
    strategy: CancellationStrategy,
    config: PollConfig,
    generation: AtomicU64,
    stats: Stats,
}

impl DescriptorTable {
    pub fn new(config: PollConfig) -> Self {
        let strategy = CancellationStrategy::probe(config.cancel_strategy);
        debug!("descriptor table: {} entries, cancellation strategy {:?}", config.table_capacity, strategy);
        DescriptorTable {
            entries: (0..config.table_capacity).map(|_| Entry::default()).collect(),
            new_descriptor: CompletionEvent::new(),
            strategy,
            config,
            generation: AtomicU64::new(0),
            stats: Stats::default(),
        }
    }

    pub fn with_capacity(table_capacity: usize) -> Self {
        Self::new(PollConfig { table_capacity, ..PollConfig::default() })
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn strategy(&self) -> CancellationStrategy {
        self.strategy
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Number of live descriptors.
    pub fn live(&self) -> usize {
        self.entries.iter().filter(|e| e.record.lock().is_some()).count()
    }

    pub(crate) fn new_descriptor_event(&self) -> &CompletionEvent {
        &self.new_descriptor
    }

    /// Wrap a native handle into a pollable descriptor with `slot_count` transfer slots.
    ///
    /// When per-operation cancel is unavailable a private duplicate of the handle is opened so
    /// a thread-scoped cancel only reaches this descriptor's transfers. On `Exhausted` nothing
    /// in the table changes.
    pub fn allocate(&self, device: Arc<dyn Device>, interest: Interest, slot_count: usize) -> Result<Descriptor> {
        if slot_count == 0 || slot_count > self.config.max_slots {
            return Err(Error::InvalidArgument("slot count out of range"));
        }
        let duplicate = if self.strategy.needs_duplicate() {
            match device.duplicate() {
                Ok(dup) => Some(dup),
                Err(e) => {
                    debug!("could not duplicate handle {:#x} ({}), using the original", device.raw_handle(), e);
                    None
                }
            }
        } else {
            None
        };

        self.install(|id, generation| {
            DescriptorRecord::new_transfer(id, generation, device, duplicate, interest, slot_count)
        })
    }

    /// Claim the first free entry for the record built by `make`.
    pub(crate) fn install(&self, make: impl FnOnce(Descriptor, u64) -> DescriptorRecord) -> Result<Descriptor> {
        for (index, entry) in self.entries.iter().enumerate() {
            if entry.occupied.load(Ordering::Acquire) {
                continue;
            }
            let mut slot = entry.record.lock();
            // Another allocator got here between the hint and the lock.
            if slot.is_some() {
                continue;
            }
            let id = Descriptor(index);
            let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
            *slot = Some(make(id, generation));
            entry.occupied.store(true, Ordering::Release);
            drop(slot);

            self.new_descriptor.set();
            self.stats.inc_allocations();
            debug!("{} allocated (generation {})", id, generation);
            return Ok(id);
        }
        self.stats.inc_exhausted();
        Err(Error::Exhausted)
    }

    /// Lock the record behind `id`.
    ///
    /// Must not be called while holding another descriptor's guard.
    pub fn lookup(&self, id: Descriptor) -> Result<MappedMutexGuard<'_, DescriptorRecord>> {
        let entry = self.entries.get(id.0).ok_or(Error::InvalidDescriptor)?;
        MutexGuard::try_map(entry.record.lock(), |r| r.as_mut()).map_err(|_| Error::InvalidDescriptor)
    }

    /// Release `id`: cancel what is still in flight, wait for it to finish, then drop the record's
    /// handles. The id may be handed out again as soon as this returns.
    pub fn free(&self, id: Descriptor) -> Result<()> {
        let entry = self.entries.get(id.0).ok_or(Error::InvalidDescriptor)?;
        let record = {
            let mut slot = entry.record.lock();
            let record = slot.take().ok_or(Error::InvalidDescriptor)?;
            entry.occupied.store(false, Ordering::Release);
            record
        };

        // Consumers blocked on a pipe wake up and find the generation gone.
        if let Some(event) = record.signal_event() {
            event.set();
        }

        let pending = record.pending_completions();
        if !pending.is_empty() {
            match record.cancel(self.strategy, None) {
                Ok(n) => self.stats.add_cancels_requested(n as u64),
                Err(e) => {
                    self.stats.inc_cancels_failed();
                    warn!("{}: cancel on free failed: {}", id, e);
                }
            }
            self.drain_pending(id, &pending);
        }

        drop(record);
        self.stats.inc_frees();
        debug!("{} freed", id);
        Ok(())
    }

    fn drain_pending(&self, id: Descriptor, pending: &[Completion]) {
        let timeout = timeout_from_ms(self.config.drain_timeout_ms);
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        for transfer in pending {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if !transfer.wait(remaining) {
                warn!(
                    "{}: slot {} still in flight after {} ms, releasing the record anyway",
                    id,
                    transfer.index(),
                    self.config.drain_timeout_ms
                );
                return;
            }
        }
    }

    /// Free every live descriptor.
    pub fn close_all(&self) {
        for index in 0..self.entries.len() {
            if self.entries[index].occupied.load(Ordering::Acquire) {
                let _ = self.free(Descriptor(index));
            }
        }
    }

    /// Mark slot `slot` of `id` in flight and return the completion to hand to the OS stack.
    pub fn arm(&self, id: Descriptor, slot: usize, requested: usize) -> Result<Completion> {
        self.lookup(id)?.arm(slot, requested)
    }

    /// Start a new batch on a fully retired descriptor.
    pub fn rearm(&self, id: Descriptor) -> Result<()> {
        self.lookup(id)?.rearm()
    }

    /// Aggregate result once every slot of the batch has retired.
    pub fn outcome(&self, id: Descriptor) -> Result<Option<TransferOutcome>> {
        Ok(self.lookup(id)?.outcome())
    }

    /// Handle transfers for `id` must be submitted on.
    pub fn io_handle(&self, id: Descriptor) -> Result<Arc<dyn Device>> {
        let record = self.lookup(id)?;
        record.io_handle().cloned().ok_or(Error::InvalidArgument("signal pipes have no device"))
    }

    /// Request cancellation of one slot of `id`, or of every slot not yet retired.
    ///
    /// Returns the number of transfers cancellation was requested for; already completed slots
    /// are skipped.
    pub fn cancel(&self, id: Descriptor, slot: Option<usize>) -> Result<usize> {
        let record = self.lookup(id)?;
        match record.cancel(self.strategy, slot) {
            Ok(n) => {
                self.stats.add_cancels_requested(n as u64);
                Ok(n)
            }
            Err(e) => {
                self.stats.inc_cancels_failed();
                Err(e)
            }
        }
    }

    /// Current generation of `id`, used to detect recycling across blocking calls.
    pub fn generation_of(&self, id: Descriptor) -> Result<u64> {
        Ok(self.lookup(id)?.generation())
    }
}

impl Drop for DescriptorTable {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::cancel::StrategyChoice;
    use crate::os::loopback::{LoopbackCaps, LoopbackDevice};
    use crate::os::slot::TransferStatus;

    fn loopback() -> Arc<LoopbackDevice> {
        LoopbackDevice::new(LoopbackCaps::default())
    }

    #[test]
    fn free_makes_entry_allocatable_again() {
        let table = DescriptorTable::with_capacity(2);
        let dev = loopback();
        let a = table.allocate(dev.clone(), Interest::Readable, 1).unwrap();
        let b = table.allocate(dev.clone(), Interest::Writable, 1).unwrap();
        assert_ne!(a, b);
        assert!(matches!(table.allocate(dev.clone(), Interest::Readable, 1), Err(Error::Exhausted)));
        assert_eq!(table.live(), 2);

        table.free(a).unwrap();
        assert!(matches!(table.lookup(a), Err(Error::InvalidDescriptor)));
        assert_eq!(table.allocate(dev, Interest::Readable, 1).unwrap(), a);
        assert_eq!(table.stats().snapshot().exhausted, 1);
    }

    #[test]
    fn exhaustion_leaves_table_untouched() {
        let table = DescriptorTable::with_capacity(1);
        let dev = loopback();
        let id = table.allocate(dev.clone(), Interest::Readable, 2).unwrap();
        let generation = table.generation_of(id).unwrap();
        assert!(table.allocate(dev, Interest::Readable, 2).is_err());
        assert_eq!(table.generation_of(id).unwrap(), generation);
        assert_eq!(table.lookup(id).unwrap().slots().len(), 2);
    }

    #[test]
    fn rejects_bad_arguments() {
        let table = DescriptorTable::with_capacity(4);
        assert!(matches!(table.allocate(loopback(), Interest::Readable, 0), Err(Error::InvalidArgument(_))));
        assert!(matches!(table.allocate(loopback(), Interest::Readable, 10_000), Err(Error::InvalidArgument(_))));
        assert!(matches!(table.free(Descriptor(99)), Err(Error::InvalidDescriptor)));
        assert!(matches!(table.free(Descriptor(0)), Err(Error::InvalidDescriptor)));
    }

    #[test]
    fn free_cancels_and_waits_for_terminal_state() {
        let caps = LoopbackCaps { cancel_delay: Some(std::time::Duration::from_millis(30)), ..LoopbackCaps::default() };
        let dev = LoopbackDevice::new(caps);
        let table = DescriptorTable::with_capacity(4);
        let id = table.allocate(dev.clone(), Interest::Readable, 2).unwrap();
        let c0 = table.arm(id, 0, 64).unwrap();
        let c1 = table.arm(id, 1, 64).unwrap();
        dev.submit(c0.clone());
        dev.submit(c1.clone());

        table.free(id).unwrap();
        assert_eq!(c0.status(), TransferStatus::Cancelled);
        assert_eq!(c1.status(), TransferStatus::Cancelled);
        assert_eq!(dev.in_flight(), 0);
    }

    #[test]
    fn duplicate_is_opened_and_closed_without_per_operation_cancel() {
        let config = PollConfig { cancel_strategy: StrategyChoice::ThreadScoped, ..PollConfig::default() };
        let table = DescriptorTable::new(config);
        let dev = loopback();
        let id = table.allocate(dev.clone(), Interest::Readable, 1).unwrap();
        assert_eq!(dev.open_duplicates(), 1);
        assert_ne!(table.io_handle(id).unwrap().raw_handle(), dev.raw_handle());

        table.free(id).unwrap();
        assert_eq!(dev.open_duplicates(), 0);
    }

    #[test]
    fn per_operation_strategy_uses_primary_handle() {
        let config = PollConfig { cancel_strategy: StrategyChoice::PerOperation, ..PollConfig::default() };
        let table = DescriptorTable::new(config);
        let dev = loopback();
        let id = table.allocate(dev.clone(), Interest::Writable, 1).unwrap();
        assert_eq!(dev.open_duplicates(), 0);
        assert_eq!(table.io_handle(id).unwrap().raw_handle(), dev.raw_handle());
    }

    #[test]
    fn cancel_of_completed_slots_is_noop() {
        let table = DescriptorTable::with_capacity(4);
        let dev = loopback();
        let id = table.allocate(dev.clone(), Interest::Readable, 2).unwrap();
        dev.submit(table.arm(id, 0, 8).unwrap());
        dev.submit(table.arm(id, 1, 8).unwrap());
        dev.complete_next_full();
        dev.complete_next_full();
        assert_eq!(table.cancel(id, None).unwrap(), 0);
        assert_eq!(table.cancel(id, Some(1)).unwrap(), 0);
        assert!(matches!(table.cancel(id, Some(5)), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn drop_frees_everything() {
        let dev = loopback();
        let config = PollConfig { cancel_strategy: StrategyChoice::ThreadScoped, ..PollConfig::default() };
        {
            let table = DescriptorTable::new(config);
            for _ in 0..3 {
                table.allocate(dev.clone(), Interest::Readable, 1).unwrap();
            }
            assert_eq!(dev.open_duplicates(), 3);
        }
        assert_eq!(dev.open_duplicates(), 0);
    }
}
