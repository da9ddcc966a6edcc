//! Simple and combined counter arrays (spec SPEC_FULL §4.6).
//!
//! Each counter is written from exactly one producer (the owning node);
//! readers take a snapshot. On 64-bit targets a `u64` load is already
//! atomic, so `AtomicU64` with `Relaxed` ordering is sufficient — no
//! sequence-number dance is needed the way the source requires on 32-bit.

use std::sync::atomic::{AtomicU64, Ordering};

/// A 64-bit monotonic counter array indexed by `sw_if_index` or adjacency
/// index (interface drop/punt counters).
pub struct SimpleCounters {
    counters: Vec<AtomicU64>,
}

impl SimpleCounters {
    pub fn new() -> Self {
        SimpleCounters {
            counters: Vec::new(),
        }
    }

    fn ensure(&mut self, index: usize) {
        if self.counters.len() <= index {
            self.counters.resize_with(index + 1, || AtomicU64::new(0));
        }
    }

    pub fn increment(&mut self, index: usize, by: u64) {
        self.ensure(index);
        self.counters[index].fetch_add(by, Ordering::Relaxed);
    }

    pub fn read(&self, index: usize) -> u64 {
        self.counters
            .get(index)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Read-and-clear snapshot, matching the source's "cleared on read via
    /// shadow copies" contract.
    pub fn snapshot(&mut self, index: usize) -> u64 {
        self.counters
            .get(index)
            .map(|c| c.swap(0, Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl Default for SimpleCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// `{packets, bytes}` combined counters, RX/TX per `sw_if_index`.
pub struct CombinedCounters {
    packets: SimpleCounters,
    bytes: SimpleCounters,
}

impl CombinedCounters {
    pub fn new() -> Self {
        CombinedCounters {
            packets: SimpleCounters::new(),
            bytes: SimpleCounters::new(),
        }
    }

    /// Increment `index`'s counter by one packet of `n_bytes`. Sub-interface
    /// callers are expected to also increment their parent hw_interface's
    /// counter (the caller passes the parent index a second time).
    pub fn increment(&mut self, index: usize, n_bytes: u64) {
        self.packets.increment(index, 1);
        self.bytes.increment(index, n_bytes);
    }

    pub fn read(&self, index: usize) -> (u64, u64) {
        (self.packets.read(index), self.bytes.read(index))
    }
}

impl Default for CombinedCounters {
    fn default() -> Self {
        Self::new()
    }
}
