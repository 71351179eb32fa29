//! Shared types of the readiness layer: descriptor ids, direction masks and wait requests.

use std::fmt;

/// Abstract pollable descriptor, the index of its entry in a `DescriptorTable`.
///
/// Ids are stable while the descriptor is live and are recycled after `free`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Descriptor(pub(crate) usize);

impl Descriptor {
    pub fn as_raw(self) -> usize {
        self.0
    }

    pub fn from_raw(raw: usize) -> Self {
        Descriptor(raw)
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd#{}", self.0)
    }
}

/// Direction mask of a descriptor, or the direction a wait request asks about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
    ReadWrite,
}

impl Interest {
    /// True when every direction of `other` is part of `self`.
    pub fn contains(self, other: Interest) -> bool {
        match (self, other) {
            (Interest::ReadWrite, _) => true,
            (a, b) => a == b,
        }
    }

    pub fn is_readable(self) -> bool {
        self.contains(Interest::Readable)
    }

    pub fn is_writable(self) -> bool {
        self.contains(Interest::Writable)
    }
}

/// One entry of a `poll` call: the descriptor, the direction of interest and the resulting readiness.
#[derive(Clone, Copy, Debug)]
pub struct WaitRequest {
    pub descriptor: Descriptor,
    pub interest: Interest,
    pub readable: bool,
    pub writable: bool,
    /// The descriptor retired with a failed aggregate result.
    pub error: bool,
}

impl WaitRequest {
    pub fn new(descriptor: Descriptor, interest: Interest) -> Self {
        WaitRequest { descriptor, interest, readable: false, writable: false, error: false }
    }

    pub fn readable(descriptor: Descriptor) -> Self {
        Self::new(descriptor, Interest::Readable)
    }

    pub fn writable(descriptor: Descriptor) -> Self {
        Self::new(descriptor, Interest::Writable)
    }

    pub fn is_ready(&self) -> bool {
        self.readable || self.writable
    }

    pub(crate) fn clear(&mut self) {
        self.readable = false;
        self.writable = false;
        self.error = false;
    }

    pub(crate) fn mark_ready(&mut self, error: bool) {
        self.readable = self.interest.is_readable();
        self.writable = self.interest.is_writable();
        self.error = error;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_contains_both() {
        assert!(Interest::ReadWrite.contains(Interest::Readable));
        assert!(Interest::ReadWrite.contains(Interest::Writable));
        assert!(!Interest::Readable.contains(Interest::Writable));
        assert!(!Interest::Writable.contains(Interest::ReadWrite));
    }

    #[test]
    fn mark_ready_follows_interest() {
        let mut req = WaitRequest::writable(Descriptor(3));
        req.mark_ready(false);
        assert!(req.writable && !req.readable && req.is_ready());
        req.clear();
        assert!(!req.is_ready());
    }
}
