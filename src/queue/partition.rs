use std::sync::Arc;

use tokio::sync::mpsc;

use crate::tracer::event::SocketEvent;

/// One ordered, single-consumer unit of the event queue.
///
/// Owns a bounded FIFO and the consumer bound to it. The receiving half is
/// handed to the partition's worker exactly once.
pub struct Partition<C> {
    index: usize,
    capacity: usize,
    tx: mpsc::Sender<SocketEvent>,
    rx: parking_lot::Mutex<Option<mpsc::Receiver<SocketEvent>>>,
    consumer: Arc<C>,
}

impl<C> Partition<C> {
    /// `capacity` must be non-zero.
    pub(crate) fn new(index: usize, capacity: usize, consumer: C) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            index,
            capacity,
            tx,
            rx: parking_lot::Mutex::new(Some(rx)),
            consumer: Arc::new(consumer),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn consumer(&self) -> &Arc<C> {
        &self.consumer
    }

    /// Events currently waiting in the queue.
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub(crate) fn sender(&self) -> mpsc::Sender<SocketEvent> {
        self.tx.clone()
    }

    pub(crate) fn take_receiver(&self) -> Option<mpsc::Receiver<SocketEvent>> {
        self.rx.lock().take()
    }
}
