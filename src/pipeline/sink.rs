use anyhow::Result;
use async_trait::async_trait;

use crate::db::{Database, ReceiptSummary};

/// Destination for flushed batches. One call per batch.
#[async_trait]
pub trait ReceiptSink: Send + Sync {
    async fn insert_many(&self, receipts: &[ReceiptSummary]) -> Result<usize>;
}

#[async_trait]
impl ReceiptSink for Database {
    async fn insert_many(&self, receipts: &[ReceiptSummary]) -> Result<usize> {
        self.insert_receipts(receipts).await
    }
}
