//! Partitioned event queue.
//!
//! Events are routed to a fixed set of partitions by hashing their
//! connection id, so every event of one connection lands in the same
//! partition and is consumed in push order by that partition's single
//! worker. Different connections proceed in parallel across partitions.
//!
//! ```text
//!   loader read tasks ──► route step ──► fnv1a(key) % N
//!                                            │
//!              ┌──────────────┬──────────────┴───┐
//!              ▼              ▼                  ▼
//!         Partition 0    Partition 1  ...   Partition N-1
//!         (bounded)      (bounded)          (bounded)
//!              │              │                  │
//!           worker         worker             worker
//!              ▼              ▼                  ▼
//!          consumer       consumer           consumer
//! ```

pub mod partition;
pub mod route;
pub mod stats;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::tracer::event::SocketEvent;
use crate::tracer::{EventDecoder, EventLoader, EventSource};

use self::partition::Partition;
use self::stats::QueueStats;

/// Handler bound 1:1 to a partition.
///
/// `consume` is only ever called from the partition's own worker, one
/// event at a time.
pub trait PartitionConsumer: Send + Sync + 'static {
    /// Called once when the partition worker boots.
    fn start(&self, cancel: CancellationToken);

    /// Handle one dequeued event.
    fn consume(&self, event: SocketEvent);
}

/// Derives the routing key of an event.
pub type RouteKeyFn = Arc<dyn Fn(&SocketEvent) -> String + Send + Sync>;

/// Registration of one kernel event source with the queue.
#[derive(Clone)]
pub struct ReceiverBinding {
    pub source: EventSource,
    pub per_cpu_buffer: usize,
    pub decoder: EventDecoder,
    pub route: RouteKeyFn,
}

impl std::fmt::Debug for ReceiverBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiverBinding")
            .field("source", &self.source)
            .field("per_cpu_buffer", &self.per_cpu_buffer)
            .finish()
    }
}

/// Lifecycle of an [`EventQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StartState {
    NotStarted = 0,
    Starting = 1,
    Started = 2,
}

impl StartState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::NotStarted,
            1 => Self::Starting,
            _ => Self::Started,
        }
    }
}

/// Sending halves of every partition, shared with loader read tasks.
struct Dispatcher {
    senders: Vec<mpsc::Sender<SocketEvent>>,
    stats: Arc<QueueStats>,
}

impl Dispatcher {
    async fn push(&self, key: &str, event: SocketEvent) {
        let index = route::partition_index(key, self.senders.len());
        let Some(tx) = self.senders.get(index) else {
            return;
        };

        // Waits while the partition is full. A closed queue means its
        // worker has shut down; the event is dropped.
        if tx.send(event).await.is_ok() {
            self.stats.record_pushed(index);
        }
    }
}

/// Route step handed to a loader for one registered receiver.
///
/// Computes the event's key with the receiver's route fn and pushes it to
/// the owning partition.
#[derive(Clone)]
pub struct RouteHandle {
    dispatcher: Arc<Dispatcher>,
    route: RouteKeyFn,
}

impl RouteHandle {
    pub async fn deliver(&self, event: SocketEvent) {
        let key = (self.route)(&event);
        self.dispatcher.push(&key, event).await;
    }
}

/// Fixed set of partitions fed by registered kernel event sources.
pub struct EventQueue<C> {
    partitions: Vec<Partition<C>>,
    receivers: parking_lot::Mutex<Vec<ReceiverBinding>>,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<QueueStats>,
    state: AtomicU8,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl<C: PartitionConsumer> EventQueue<C> {
    /// Build `partition_count` partitions of `size_per_partition` capacity,
    /// creating one consumer per partition up front.
    pub fn new<F>(
        partition_count: usize,
        size_per_partition: usize,
        mut new_consumer: F,
    ) -> Result<Self>
    where
        F: FnMut(usize) -> C,
    {
        if partition_count == 0 {
            bail!("partition count must be positive");
        }
        if size_per_partition == 0 {
            bail!("partition queue size must be positive");
        }

        let partitions: Vec<Partition<C>> = (0..partition_count)
            .map(|index| Partition::new(index, size_per_partition, new_consumer(index)))
            .collect();

        let stats = Arc::new(QueueStats::new(partition_count));
        let dispatcher = Arc::new(Dispatcher {
            senders: partitions.iter().map(Partition::sender).collect(),
            stats: Arc::clone(&stats),
        });

        Ok(Self {
            partitions,
            receivers: parking_lot::Mutex::new(Vec::with_capacity(2)),
            dispatcher,
            stats,
            state: AtomicU8::new(StartState::NotStarted as u8),
            workers: parking_lot::Mutex::new(Vec::with_capacity(partition_count)),
        })
    }

    /// Record a kernel event source to read once the queue starts.
    ///
    /// Registrations after `start` have no effect.
    pub fn register_receiver(
        &self,
        source: EventSource,
        per_cpu_buffer: usize,
        decoder: EventDecoder,
        route: RouteKeyFn,
    ) {
        let mut receivers = self.receivers.lock();
        if self.state() != StartState::NotStarted {
            warn!(source = %source, "event queue already started, ignoring receiver");
            return;
        }

        receivers.push(ReceiverBinding {
            source,
            per_cpu_buffer,
            decoder,
            route,
        });
    }

    /// Start reading every registered source and spawn one worker per
    /// partition.
    ///
    /// Only the first call does anything; later and concurrent calls return
    /// immediately. Must be called from within a tokio runtime.
    pub fn start(&self, cancel: &CancellationToken, loader: &dyn EventLoader) -> Result<()> {
        if self
            .state
            .compare_exchange(
                StartState::NotStarted as u8,
                StartState::Starting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            debug!("event queue already started");
            return Ok(());
        }

        let receivers = self.receivers.lock().clone();
        let result = self.start_receivers(&receivers, cancel, loader);

        // Workers run even if a source failed so events from the sources
        // that did start are still consumed until the caller cancels.
        self.spawn_workers(cancel);
        self.state
            .store(StartState::Started as u8, Ordering::Release);

        info!(
            partitions = self.partitions.len(),
            receivers = receivers.len(),
            "event queue started"
        );

        result
    }

    fn start_receivers(
        &self,
        receivers: &[ReceiverBinding],
        cancel: &CancellationToken,
        loader: &dyn EventLoader,
    ) -> Result<()> {
        for receiver in receivers {
            let route = RouteHandle {
                dispatcher: Arc::clone(&self.dispatcher),
                route: Arc::clone(&receiver.route),
            };
            loader
                .read_events_async(
                    &receiver.source,
                    receiver.per_cpu_buffer,
                    receiver.decoder,
                    route,
                    cancel.clone(),
                )
                .with_context(|| format!("reading events from {}", receiver.source))?;
        }
        Ok(())
    }

    fn spawn_workers(&self, cancel: &CancellationToken) {
        let mut workers = self.workers.lock();
        for partition in &self.partitions {
            let Some(rx) = partition.take_receiver() else {
                continue;
            };
            workers.push(tokio::spawn(run_worker(
                partition.index(),
                rx,
                Arc::clone(partition.consumer()),
                Arc::clone(&self.stats),
                cancel.clone(),
            )));
        }
    }

    /// Route `event` to the partition owning `key` and enqueue it.
    ///
    /// Suspends while that partition's queue is full.
    pub async fn push(&self, key: &str, event: SocketEvent) {
        self.dispatcher.push(key, event).await;
    }

    /// Index of the partition owning `key`.
    pub fn partition_for(&self, key: &str) -> usize {
        route::partition_index(key, self.partitions.len())
    }

    pub fn partitions(&self) -> &[Partition<C>] {
        &self.partitions
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Events waiting in partition `index`, or None if out of range.
    pub fn queue_depth(&self, index: usize) -> Option<usize> {
        self.partitions.get(index).map(Partition::depth)
    }

    pub fn state(&self) -> StartState {
        StartState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> &Arc<QueueStats> {
        &self.stats
    }

    /// Wait for the partition workers to exit after the start token is
    /// cancelled.
    pub async fn wait_for_shutdown(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "partition worker join failed");
            }
        }
    }
}

async fn run_worker<C: PartitionConsumer>(
    index: usize,
    mut rx: mpsc::Receiver<SocketEvent>,
    consumer: Arc<C>,
    stats: Arc<QueueStats>,
    cancel: CancellationToken,
) {
    consumer.start(cancel.clone());
    debug!(partition = index, "partition worker started");

    loop {
        tokio::select! {
            // Cancellation wins over queued events; they are discarded.
            biased;
            _ = cancel.cancelled() => break,
            event = rx.recv() => {
                let Some(event) = event else { break };
                consumer.consume(event);
                stats.record_consumed(index);
            }
        }
    }

    debug!(partition = index, "partition worker stopped");
}
