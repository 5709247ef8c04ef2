//! Bounded FIFO between the analysis handler and the batch writer.
//!
//! `put` waits while the queue is full and `get` waits while it is empty. A
//! full queue stalls the producer; nothing is dropped.

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError};

use crate::db::ReceiptSummary;

pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub enum WorkQueueEntry {
    Receipt(Box<ReceiptSummary>),
    /// Flush whatever has been accumulated so far.
    Flush,
}

impl WorkQueueEntry {
    pub fn receipt(summary: ReceiptSummary) -> Self {
        WorkQueueEntry::Receipt(Box::new(summary))
    }

    pub fn is_flush(&self) -> bool {
        matches!(self, WorkQueueEntry::Flush)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue capacity must be at least 1")]
    ZeroCapacity,
    #[error("work queue is closed")]
    Closed,
}

#[derive(Debug, PartialEq)]
pub enum TryGet {
    Entry(WorkQueueEntry),
    Empty,
    Closed,
}

#[derive(Debug, Clone)]
pub struct QueueProducer {
    tx: mpsc::Sender<WorkQueueEntry>,
}

#[derive(Debug)]
pub struct QueueConsumer {
    rx: mpsc::Receiver<WorkQueueEntry>,
}

pub fn bounded(capacity: usize) -> Result<(QueueProducer, QueueConsumer), QueueError> {
    if capacity == 0 {
        return Err(QueueError::ZeroCapacity);
    }
    let (tx, rx) = mpsc::channel(capacity);
    Ok((QueueProducer { tx }, QueueConsumer { rx }))
}

impl QueueProducer {
    /// Blocks while the queue is full.
    pub async fn put(&self, entry: WorkQueueEntry) -> Result<(), QueueError> {
        self.tx.send(entry).await.map_err(|_| QueueError::Closed)
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Entries currently waiting in the queue.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl QueueConsumer {
    /// Blocks while the queue is empty. `None` once every producer is gone and
    /// the queue is drained.
    pub async fn get(&mut self) -> Option<WorkQueueEntry> {
        self.rx.recv().await
    }

    pub fn try_get(&mut self) -> TryGet {
        match self.rx.try_recv() {
            Ok(entry) => TryGet::Entry(entry),
            Err(TryRecvError::Empty) => TryGet::Empty,
            Err(TryRecvError::Disconnected) => TryGet::Closed,
        }
    }
}
