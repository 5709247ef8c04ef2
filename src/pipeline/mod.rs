//! Bounded hand-off between analysis and storage.

pub mod queue;
pub mod sink;
pub mod writer;

pub use queue::{bounded, QueueConsumer, QueueError, QueueProducer, TryGet, WorkQueueEntry};
pub use sink::ReceiptSink;
pub use writer::{BatchWriter, WriterState, WriterStats};
