pub mod receipt;

pub use receipt::{ReceiptLineItem, ReceiptSummary, StoredReceipt};
