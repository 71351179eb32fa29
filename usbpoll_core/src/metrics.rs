use std::sync::atomic::{AtomicU64, Ordering};

/// Per-table counters for Prometheus exposition.
/// All counters are relaxed atomics; they are advisory and never used for synchronization.
#[derive(Debug, Default)]
pub struct Stats {
    allocations: AtomicU64,
    exhausted: AtomicU64,
    frees: AtomicU64,
    polls: AtomicU64,
    poll_timeouts: AtomicU64,
    poll_interrupts: AtomicU64,
    short_transfers: AtomicU64,
    cancels_requested: AtomicU64,
    cancels_failed: AtomicU64,
    pipe_signals: AtomicU64,
}

/// Point-in-time copy of `Stats`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub allocations: u64,
    pub exhausted: u64,
    pub frees: u64,
    pub polls: u64,
    pub poll_timeouts: u64,
    pub poll_interrupts: u64,
    pub short_transfers: u64,
    pub cancels_requested: u64,
    pub cancels_failed: u64,
    pub pipe_signals: u64,
}

impl Stats {
    pub fn inc_allocations(&self) { self.allocations.fetch_add(1, Ordering::Relaxed); }
    pub fn inc_exhausted(&self) { self.exhausted.fetch_add(1, Ordering::Relaxed); }
    pub fn inc_frees(&self) { self.frees.fetch_add(1, Ordering::Relaxed); }
    pub fn inc_polls(&self) { self.polls.fetch_add(1, Ordering::Relaxed); }
    pub fn inc_poll_timeouts(&self) { self.poll_timeouts.fetch_add(1, Ordering::Relaxed); }
    pub fn inc_poll_interrupts(&self) { self.poll_interrupts.fetch_add(1, Ordering::Relaxed); }
    pub fn inc_short_transfers(&self) { self.short_transfers.fetch_add(1, Ordering::Relaxed); }
    pub fn add_cancels_requested(&self, n: u64) { self.cancels_requested.fetch_add(n, Ordering::Relaxed); }
    pub fn inc_cancels_failed(&self) { self.cancels_failed.fetch_add(1, Ordering::Relaxed); }
    pub fn inc_pipe_signals(&self) { self.pipe_signals.fetch_add(1, Ordering::Relaxed); }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            allocations: self.allocations.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            polls: self.polls.load(Ordering::Relaxed),
            poll_timeouts: self.poll_timeouts.load(Ordering::Relaxed),
            poll_interrupts: self.poll_interrupts.load(Ordering::Relaxed),
            short_transfers: self.short_transfers.load(Ordering::Relaxed),
            cancels_requested: self.cancels_requested.load(Ordering::Relaxed),
            cancels_failed: self.cancels_failed.load(Ordering::Relaxed),
            pipe_signals: self.pipe_signals.load(Ordering::Relaxed),
        }
    }

    /// Render counters in Prometheus exposition format.
    pub fn render(&self) -> String {
        let s = self.snapshot();
        let counters = [
            ("usbpoll_allocations_total", s.allocations),
            ("usbpoll_exhausted_total", s.exhausted),
            ("usbpoll_frees_total", s.frees),
            ("usbpoll_polls_total", s.polls),
            ("usbpoll_poll_timeouts_total", s.poll_timeouts),
            ("usbpoll_poll_interrupts_total", s.poll_interrupts),
            ("usbpoll_short_transfers_total", s.short_transfers),
            ("usbpoll_cancels_requested_total", s.cancels_requested),
            ("usbpoll_cancels_failed_total", s.cancels_failed),
            ("usbpoll_pipe_signals_total", s.pipe_signals),
        ];
        let mut out = String::new();
        for (name, value) in counters {
            out.push_str(&format!("# TYPE {} counter\n{} {}\n", name, name, value));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_lists_every_counter() {
        let stats = Stats::default();
        stats.inc_polls();
        stats.inc_polls();
        stats.add_cancels_requested(3);
        let text = stats.render();
        assert!(text.contains("usbpoll_polls_total 2\n"));
        assert!(text.contains("usbpoll_cancels_requested_total 3\n"));
        assert_eq!(text.matches("# TYPE").count(), 10);
    }
}
