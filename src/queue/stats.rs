use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free per-partition push/consume counters.
pub struct QueueStats {
    pushed: Vec<AtomicU64>,
    consumed: Vec<AtomicU64>,
}

/// Counts for one partition since the previous snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionCounts {
    pub pushed: u64,
    pub consumed: u64,
}

impl QueueStats {
    pub fn new(partition_count: usize) -> Self {
        Self {
            pushed: (0..partition_count).map(|_| AtomicU64::new(0)).collect(),
            consumed: (0..partition_count).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn record_pushed(&self, partition: usize) {
        if let Some(counter) = self.pushed.get(partition) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_consumed(&self, partition: usize) {
        if let Some(counter) = self.consumed.get(partition) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Atomically read and reset all counters, indexed by partition.
    pub fn snapshot(&self) -> Vec<PartitionCounts> {
        self.pushed
            .iter()
            .zip(&self.consumed)
            .map(|(pushed, consumed)| PartitionCounts {
                pushed: pushed.swap(0, Ordering::Relaxed),
                consumed: consumed.swap(0, Ordering::Relaxed),
            })
            .collect()
    }
}
