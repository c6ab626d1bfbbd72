//! In-process loader backed by bounded channels of raw records.
//!
//! Each named source is a channel of records laid out exactly as the kernel
//! writes them, so everything downstream of the perf buffer (decoding,
//! routing, partition workers) runs unchanged. Used for replay, tests and
//! benchmarks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::queue::RouteHandle;

use super::stats::ReaderStats;
use super::{forward_record, EventDecoder, EventLoader, EventSource};

struct SourceChannel {
    tx: mpsc::Sender<Vec<u8>>,
    /// Taken by the read task.
    rx: Option<mpsc::Receiver<Vec<u8>>>,
}

/// Loader whose sources are fed through [`ChannelLoader::sender`].
pub struct ChannelLoader {
    capacity: usize,
    sources: parking_lot::Mutex<HashMap<EventSource, SourceChannel>>,
    stats: Arc<ReaderStats>,
    readers_started: AtomicUsize,
}

impl ChannelLoader {
    /// Create a loader whose source channels hold `capacity` records each.
    pub fn new(capacity: usize) -> Self {
        Self::with_stats(capacity, Arc::new(ReaderStats::new()))
    }

    pub fn with_stats(capacity: usize, stats: Arc<ReaderStats>) -> Self {
        Self {
            capacity: capacity.max(1),
            sources: parking_lot::Mutex::new(HashMap::new()),
            stats,
            readers_started: AtomicUsize::new(0),
        }
    }

    /// Returns the sending half for `source`, creating the channel on first use.
    pub fn sender(&self, source: &EventSource) -> mpsc::Sender<Vec<u8>> {
        let mut sources = self.sources.lock();
        sources
            .entry(source.clone())
            .or_insert_with(|| Self::new_channel(self.capacity))
            .tx
            .clone()
    }

    /// Reader statistics shared by every read task of this loader.
    pub fn stats(&self) -> Arc<ReaderStats> {
        Arc::clone(&self.stats)
    }

    /// Number of read tasks started so far.
    pub fn readers_started(&self) -> usize {
        self.readers_started.load(Ordering::SeqCst)
    }

    fn new_channel(capacity: usize) -> SourceChannel {
        let (tx, rx) = mpsc::channel(capacity);
        SourceChannel { tx, rx: Some(rx) }
    }
}

impl EventLoader for ChannelLoader {
    fn read_events_async(
        &self,
        source: &EventSource,
        per_cpu_buffer: usize,
        decoder: EventDecoder,
        route: RouteHandle,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut rx = {
            let mut sources = self.sources.lock();
            let channel = sources
                .entry(source.clone())
                .or_insert_with(|| Self::new_channel(self.capacity));
            match channel.rx.take() {
                Some(rx) => rx,
                None => bail!("source {source} is already being read"),
            }
        };

        self.readers_started.fetch_add(1, Ordering::SeqCst);
        let stats = Arc::clone(&self.stats);
        let source = source.clone();

        debug!(source = %source, per_cpu_buffer, "channel reader started");

        tokio::spawn(async move {
            loop {
                let raw = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    raw = rx.recv() => match raw {
                        Some(raw) => raw,
                        None => break,
                    },
                };

                // Delivery may wait on a full partition queue.
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = forward_record(&raw, decoder, &route, &stats, &source) => {}
                }
            }

            debug!(source = %source, "channel reader stopped");
        });

        Ok(())
    }
}
