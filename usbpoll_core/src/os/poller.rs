//! The readiness waiter: `poll` over descriptors backed by completion handles.
//!
//! Each pass drains every requested descriptor without blocking. If anything is ready the call
//! returns that set at once. Otherwise it blocks on the first incomplete completion handle of each
//! request plus the table's "new descriptor" event, then loops with whatever time is left.

use std::time::Instant;

use log::{debug, error};

use super::event::{timeout_from_ms, wait_any, CompletionEvent};
use super::interest::{Interest, WaitRequest};
use super::record::Drain;
use super::table::DescriptorTable;
use crate::error::{Error, Result};

impl DescriptorTable {
    /// Wait until at least one request is ready.
    ///
    /// Returns the number of ready requests, with readiness recorded in each `WaitRequest`, or
    /// `Ok(0)` when `timeout_ms` elapses. `timeout_ms == 0` never blocks and a negative timeout
    /// waits forever. `Interrupted` means a descriptor was registered while waiting and the
    /// caller should rebuild its request set.
    ///
    /// Request errors fail the whole call: an unknown descriptor is `InvalidDescriptor`, a
    /// direction outside the descriptor's mask is `AccessDenied`, and a request for both
    /// directions at once is rejected.
    pub fn poll(&self, requests: &mut [WaitRequest], timeout_ms: isize) -> Result<usize> {
        self.stats().inc_polls();
        // Reset before the snapshot: a registration from here on is caught by the wait below.
        self.new_descriptor_event().reset();

        let timeout = timeout_from_ms(timeout_ms);
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        for req in requests.iter_mut() {
            req.clear();
        }

        loop {
            let mut ready = 0;
            let mut handles: Vec<CompletionEvent> = Vec::with_capacity(requests.len() + 1);

            for req in requests.iter_mut() {
                if req.interest == Interest::ReadWrite {
                    return Err(Error::InvalidArgument("a request may ask for one direction only"));
                }
                let mut record = self.lookup(req.descriptor)?;
                if !record.interest().contains(req.interest) {
                    return Err(Error::AccessDenied(req.interest));
                }
                match record.drain(self.strategy(), self.stats())? {
                    Drain::Ready { error } => {
                        req.mark_ready(error);
                        ready += 1;
                    }
                    Drain::Waiting(event) => handles.push(event),
                }
            }

            if ready > 0 {
                return Ok(ready);
            }

            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if remaining.map_or(false, |r| r.is_zero()) {
                self.stats().inc_poll_timeouts();
                return Ok(0);
            }

            handles.push(self.new_descriptor_event().clone());
            let wait_set: Vec<&CompletionEvent> = handles.iter().collect();
            match wait_any(&wait_set, remaining) {
                None => {
                    self.stats().inc_poll_timeouts();
                    return Ok(0);
                }
                Some(i) if i == wait_set.len() - 1 => {
                    debug!("new descriptor registered while polling");
                    self.stats().inc_poll_interrupts();
                    return Err(Error::Interrupted);
                }
                Some(i) if i < requests.len() => {}
                Some(_) => {
                    error!("wait returned an index outside the wait set");
                    return Err(Error::Internal("woke with nothing ready and nothing to wait on"));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::os::interest::Descriptor;
    use crate::os::loopback::{LoopbackCaps, LoopbackDevice};

    fn setup(slots: usize, interest: Interest) -> (DescriptorTable, Arc<LoopbackDevice>, Descriptor) {
        let table = DescriptorTable::with_capacity(8);
        let dev = LoopbackDevice::new(LoopbackCaps::default());
        let id = table.allocate(dev.clone(), interest, slots).unwrap();
        (table, dev, id)
    }

    #[test]
    fn empty_poll_with_zero_timeout_returns_immediately() {
        let table = DescriptorTable::with_capacity(1);
        let start = Instant::now();
        assert_eq!(table.poll(&mut [], 0).unwrap(), 0);
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn direction_mismatch_is_access_denied() {
        let (table, _dev, id) = setup(1, Interest::Readable);
        let err = table.poll(&mut [WaitRequest::writable(id)], 0).unwrap_err();
        assert!(matches!(err, Error::AccessDenied(Interest::Writable)));

        let (table, _dev, id) = setup(1, Interest::Writable);
        let err = table.poll(&mut [WaitRequest::readable(id)], 0).unwrap_err();
        assert!(matches!(err, Error::AccessDenied(Interest::Readable)));
    }

    #[test]
    fn both_directions_in_one_request_rejected() {
        let (table, _dev, id) = setup(1, Interest::ReadWrite);
        let err = table.poll(&mut [WaitRequest::new(id, Interest::ReadWrite)], 0).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn stale_descriptor_fails_whole_call() {
        let (table, _dev, id) = setup(1, Interest::Readable);
        table.free(id).unwrap();
        assert!(matches!(table.poll(&mut [WaitRequest::readable(id)], 0), Err(Error::InvalidDescriptor)));
    }

    #[test]
    fn pending_slot_times_out() {
        let (table, dev, id) = setup(1, Interest::Readable);
        dev.submit(table.arm(id, 0, 32).unwrap());
        let mut reqs = [WaitRequest::readable(id)];
        assert_eq!(table.poll(&mut reqs, 0).unwrap(), 0);
        assert_eq!(table.poll(&mut reqs, 20).unwrap(), 0);
        assert!(!reqs[0].is_ready());
        assert_eq!(table.stats().snapshot().poll_timeouts, 2);
    }

    #[test]
    fn wakes_when_last_slot_completes() {
        let (table, dev, id) = setup(2, Interest::Readable);
        dev.submit(table.arm(id, 0, 16).unwrap());
        dev.submit(table.arm(id, 1, 16).unwrap());

        let completer = {
            let dev = dev.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                dev.complete_next_full();
                thread::sleep(Duration::from_millis(20));
                dev.complete_next_full();
            })
        };

        let mut reqs = [WaitRequest::readable(id)];
        assert_eq!(table.poll(&mut reqs, 10_000).unwrap(), 1);
        assert!(reqs[0].readable && !reqs[0].writable && !reqs[0].error);
        completer.join().unwrap();

        let outcome = table.outcome(id).unwrap().unwrap();
        assert_eq!(outcome.bytes, 32);
        assert!(!outcome.aborted);
    }

    #[test]
    fn only_ready_requests_are_reported() {
        let table = DescriptorTable::with_capacity(8);
        let dev = LoopbackDevice::new(LoopbackCaps::default());
        let idle = table.allocate(dev.clone(), Interest::Readable, 1).unwrap();
        let busy = table.allocate(dev.clone(), Interest::Writable, 1).unwrap();
        dev.submit(table.arm(idle, 0, 4).unwrap());
        dev.submit(table.arm(busy, 0, 4).unwrap());
        dev.complete_next_full();

        let mut reqs = [WaitRequest::readable(idle), WaitRequest::writable(busy)];
        assert_eq!(table.poll(&mut reqs, 0).unwrap(), 1);
        assert!(reqs[0].readable);
        assert!(!reqs[1].is_ready());
    }

    #[test]
    fn failed_transfer_sets_error_flag() {
        let (table, dev, id) = setup(1, Interest::Readable);
        dev.submit(table.arm(id, 0, 16).unwrap());
        dev.fail_next(libc::EIO);
        let mut reqs = [WaitRequest::readable(id)];
        assert_eq!(table.poll(&mut reqs, 0).unwrap(), 1);
        assert!(reqs[0].error);
        assert!(table.outcome(id).unwrap().unwrap().result().is_err());
    }
}
