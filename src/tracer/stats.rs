use std::sync::atomic::{AtomicU64, Ordering};

use super::event::{EventKind, EVENT_KIND_CARDINALITY};

/// Lock-free counters shared by a loader's read tasks.
///
/// `snapshot()` atomically reads and resets all counters, making it
/// suitable for periodic reporting without contention.
pub struct ReaderStats {
    received: [AtomicU64; EVENT_KIND_CARDINALITY],
    decode_errors: AtomicU64,
    lost: AtomicU64,
}

/// Counter values captured by [`ReaderStats::snapshot`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReaderSnapshot {
    /// Non-zero received counts by event kind.
    pub received: Vec<(EventKind, u64)>,
    pub decode_errors: u64,
    /// Records the kernel reported as lost before they were read.
    pub lost: u64,
}

impl ReaderStats {
    pub fn new() -> Self {
        Self {
            received: std::array::from_fn(|_| AtomicU64::new(0)),
            decode_errors: AtomicU64::new(0),
            lost: AtomicU64::new(0),
        }
    }

    /// Increment the received counter for the given kind by one.
    pub fn record(&self, kind: EventKind) {
        if let Some(counter) = self.received.get(kind as usize) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lost(&self, n: u64) {
        self.lost.fetch_add(n, Ordering::Relaxed);
    }

    /// Atomically read and reset all counters.
    pub fn snapshot(&self) -> ReaderSnapshot {
        let mut received = Vec::new();
        for (i, counter) in self.received.iter().enumerate() {
            let v = counter.swap(0, Ordering::Relaxed);
            if v > 0 {
                if let Some(kind) = EventKind::from_u8(i as u8) {
                    received.push((kind, v));
                }
            }
        }

        ReaderSnapshot {
            received,
            decode_errors: self.decode_errors.swap(0, Ordering::Relaxed),
            lost: self.lost.swap(0, Ordering::Relaxed),
        }
    }
}

impl Default for ReaderStats {
    fn default() -> Self {
        Self::new()
    }
}
