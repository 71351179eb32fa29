//! Signal pipes: descriptors with no data path, used to wake a blocked `poll` from another thread.
//!
//! Both ends of a pipe are the same descriptor; no payload is carried, so a separate read end
//! would buy nothing. The completion handle of the pipe's single permanent slot acts as the
//! readable bit and an explicit counter makes it a counting semaphore: N signals need N consumes
//! before the handle goes back to non-signaled.

use std::time::Instant;

use super::event::timeout_from_ms;
use super::interest::Descriptor;
use super::record::DescriptorRecord;
use super::table::DescriptorTable;
use crate::error::{Error, Result};

impl DescriptorTable {
    /// Create a signal pipe. Returns `(read_end, write_end)`, which are the same descriptor.
    pub fn create_pipe(&self) -> Result<(Descriptor, Descriptor)> {
        let id = self.install(DescriptorRecord::new_pipe)?;
        Ok((id, id))
    }

    /// Raise one signal on the pipe.
    pub fn signal(&self, id: Descriptor) -> Result<()> {
        self.lookup(id)?.signal()?;
        self.stats().inc_pipe_signals();
        Ok(())
    }

    /// Take one signal, waiting up to `timeout_ms` (negative waits forever).
    ///
    /// Fails with `TimedOut` when no signal arrived in time and with `InvalidDescriptor` when the
    /// pipe was freed while waiting.
    pub fn consume(&self, id: Descriptor, timeout_ms: isize) -> Result<()> {
        let (event, generation) = {
            let record = self.lookup(id)?;
            let event = record.signal_event().ok_or(Error::InvalidDescriptor)?.clone();
            (event, record.generation())
        };
        let deadline = timeout_from_ms(timeout_ms).and_then(|t| Instant::now().checked_add(t));

        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if !event.wait(remaining) {
                return Err(Error::TimedOut);
            }
            let record = self.lookup(id)?;
            if record.generation() != generation {
                return Err(Error::InvalidDescriptor);
            }
            if record.try_consume()? {
                return Ok(());
            }
            // Another consumer took the last signal between our wake and the lock.
            drop(record);
            if deadline.map_or(false, |d| Instant::now() >= d) {
                return Err(Error::TimedOut);
            }
        }
    }

    /// Signal-pipe write. Exactly one byte per call; its value is ignored.
    pub fn write(&self, id: Descriptor, buf: &[u8]) -> Result<usize> {
        if buf.len() != 1 {
            return Err(Error::InvalidArgument("signal pipes transfer exactly one byte"));
        }
        self.signal(id)?;
        Ok(1)
    }

    /// Signal-pipe read. Blocks until a signal is available; exactly one byte per call.
    pub fn read(&self, id: Descriptor, buf: &mut [u8]) -> Result<usize> {
        if buf.len() != 1 {
            return Err(Error::InvalidArgument("signal pipes transfer exactly one byte"));
        }
        self.consume(id, -1)?;
        buf[0] = 0;
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::os::interest::{Interest, WaitRequest};
    use crate::os::loopback::{LoopbackCaps, LoopbackDevice};

    #[test]
    fn pipe_ends_share_one_descriptor() {
        let table = DescriptorTable::with_capacity(2);
        let (r, w) = table.create_pipe().unwrap();
        assert_eq!(r, w);
        assert!(table.lookup(r).unwrap().is_signal_pipe());
    }

    #[test]
    fn n_signals_need_n_consumes() {
        let table = DescriptorTable::with_capacity(2);
        let (r, w) = table.create_pipe().unwrap();
        for _ in 0..3 {
            table.signal(w).unwrap();
        }
        for _ in 0..3 {
            table.consume(r, 0).unwrap();
        }
        assert!(matches!(table.consume(r, 10), Err(Error::TimedOut)));
        assert_eq!(table.stats().snapshot().pipe_signals, 3);
    }

    #[test]
    fn one_byte_contract() {
        let table = DescriptorTable::with_capacity(2);
        let (r, w) = table.create_pipe().unwrap();
        assert!(matches!(table.write(w, &[1, 2]), Err(Error::InvalidArgument(_))));
        assert_eq!(table.write(w, &[7]).unwrap(), 1);
        let mut buf = [0xffu8; 1];
        assert_eq!(table.read(r, &mut buf).unwrap(), 1);
        assert!(matches!(table.read(r, &mut [0u8; 4]), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn signal_on_transfer_descriptor_is_rejected() {
        let table = DescriptorTable::with_capacity(2);
        let dev = LoopbackDevice::new(LoopbackCaps::default());
        let id = table.allocate(dev, Interest::Readable, 1).unwrap();
        assert!(matches!(table.signal(id), Err(Error::InvalidDescriptor)));
        assert!(matches!(table.consume(id, 0), Err(Error::InvalidDescriptor)));
    }

    #[test]
    fn write_wakes_blocked_poll() {
        let table = Arc::new(DescriptorTable::with_capacity(4));
        let (r, w) = table.create_pipe().unwrap();

        let writer = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                table.write(w, &[1]).unwrap();
            })
        };

        let mut reqs = [WaitRequest::readable(r)];
        let start = Instant::now();
        assert_eq!(table.poll(&mut reqs, 10_000).unwrap(), 1);
        assert!(start.elapsed() < Duration::from_secs(5));
        writer.join().unwrap();

        // Still readable until consumed.
        assert_eq!(table.poll(&mut reqs, 0).unwrap(), 1);
        let mut byte = [0u8];
        table.read(r, &mut byte).unwrap();
        assert_eq!(table.poll(&mut reqs, 0).unwrap(), 0);
    }

    #[test]
    fn free_wakes_blocked_consumer() {
        let table = Arc::new(DescriptorTable::with_capacity(4));
        let (r, _w) = table.create_pipe().unwrap();
        let consumer = {
            let table = Arc::clone(&table);
            thread::spawn(move || table.consume(r, 10_000))
        };
        thread::sleep(Duration::from_millis(50));
        table.free(r).unwrap();
        assert!(matches!(consumer.join().unwrap(), Err(Error::InvalidDescriptor)));
    }
}
