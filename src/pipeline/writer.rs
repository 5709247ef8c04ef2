//! Background consumer that turns queued receipts into batched sink writes.
//!
//! Receipts accumulate until a flush marker is pulled or the queue stays empty
//! for one poll interval; the accumulated batch then goes to the sink in a
//! single call. Everything queued before a marker is flushed before anything
//! queued after it.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::queue::{QueueConsumer, TryGet, WorkQueueEntry};
use super::sink::ReceiptSink;
use crate::db::ReceiptSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WriterState {
    Draining,
    Flushing,
    Closed,
}

/// What one pull from the queue produced.
#[derive(Debug, PartialEq)]
pub enum Pulled {
    Entry(WorkQueueEntry),
    /// Nothing arrived within the poll interval.
    Idle,
    /// Producers are gone and the queue is empty, or shutdown was requested.
    Closed,
}

#[derive(Debug, PartialEq)]
pub enum WriterStep {
    Accumulate(Box<ReceiptSummary>),
    Flush,
    Wait,
    FlushAndStop,
}

impl WriterState {
    pub fn step(self, pulled: Pulled, pending: usize) -> (WriterState, WriterStep) {
        match pulled {
            Pulled::Entry(WorkQueueEntry::Receipt(summary)) => {
                (WriterState::Draining, WriterStep::Accumulate(summary))
            }
            Pulled::Entry(WorkQueueEntry::Flush) => (WriterState::Flushing, WriterStep::Flush),
            Pulled::Idle if pending > 0 => (WriterState::Flushing, WriterStep::Flush),
            Pulled::Idle => (WriterState::Draining, WriterStep::Wait),
            Pulled::Closed => (WriterState::Closed, WriterStep::FlushAndStop),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriterStats {
    pub batches_written: u64,
    pub receipts_written: u64,
    pub batches_failed: u64,
    pub receipts_dropped: u64,
}

pub struct BatchWriter {
    consumer: QueueConsumer,
    sink: Arc<dyn ReceiptSink>,
    poll_interval: Duration,
    batch: Vec<ReceiptSummary>,
    stats: WriterStats,
}

impl BatchWriter {
    pub fn new(consumer: QueueConsumer, sink: Arc<dyn ReceiptSink>, poll_interval: Duration) -> Self {
        Self {
            consumer,
            sink,
            poll_interval,
            batch: Vec::new(),
            stats: WriterStats::default(),
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<WriterStats> {
        tokio::spawn(self.run(shutdown))
    }

    /// Runs until every producer is dropped or `shutdown` fires. Whatever is
    /// still queued at that point is flushed before returning.
    pub async fn run(mut self, shutdown: CancellationToken) -> WriterStats {
        let mut state = WriterState::Draining;

        while state != WriterState::Closed {
            let pulled = self.pull(&shutdown).await;
            let (next, step) = state.step(pulled, self.batch.len());
            state = next;

            match step {
                WriterStep::Accumulate(summary) => {
                    debug!("queued receipt {} for the next batch", summary.image_id);
                    self.batch.push(*summary);
                }
                WriterStep::Flush => {
                    self.flush().await;
                    state = WriterState::Draining;
                }
                WriterStep::Wait => {}
                WriterStep::FlushAndStop => self.drain_remaining().await,
            }
        }

        info!(
            "batch writer stopped: {} receipts in {} batches, {} failed batches",
            self.stats.receipts_written, self.stats.batches_written, self.stats.batches_failed
        );
        self.stats
    }

    async fn pull(&mut self, shutdown: &CancellationToken) -> Pulled {
        if shutdown.is_cancelled() {
            return Pulled::Closed;
        }

        match self.consumer.try_get() {
            TryGet::Entry(entry) => return Pulled::Entry(entry),
            TryGet::Closed => return Pulled::Closed,
            TryGet::Empty => {}
        }

        tokio::select! {
            entry = self.consumer.get() => match entry {
                Some(entry) => Pulled::Entry(entry),
                None => Pulled::Closed,
            },
            _ = sleep(self.poll_interval) => Pulled::Idle,
            _ = shutdown.cancelled() => Pulled::Closed,
        }
    }

    /// Pull whatever is left without waiting. Markers still split batches.
    async fn drain_remaining(&mut self) {
        while let TryGet::Entry(entry) = self.consumer.try_get() {
            match entry {
                WorkQueueEntry::Receipt(summary) => self.batch.push(*summary),
                WorkQueueEntry::Flush => self.flush().await,
            }
        }
        self.flush().await;
    }

    async fn flush(&mut self) {
        if self.batch.is_empty() {
            debug!("flush requested with an empty batch");
            return;
        }

        let batch = std::mem::take(&mut self.batch);
        match self.sink.insert_many(&batch).await {
            Ok(written) => {
                self.stats.batches_written += 1;
                self.stats.receipts_written += written as u64;
                info!("Wrote batch of {written} receipts");
            }
            Err(err) => {
                // The batch is not retried.
                self.stats.batches_failed += 1;
                self.stats.receipts_dropped += batch.len() as u64;
                error!("failed to write batch of {} receipts: {err:#}", batch.len());
            }
        }
    }
}
