//! Receipt data models.
//!
//! A `ReceiptSummary` is produced for every staged image that the analysis
//! service could read. `image_id` is the staged file's stem (the content hash)
//! and acts as the natural, non-enforced de-duplication key.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const DEFAULT_VENDOR: &str = "Unknown";
pub const DEFAULT_CURRENCY: &str = "US Dollars";

/// Money values are kept at two decimal places.
pub const MONEY_SCALE: u32 = 2;
/// Significant digits a money value may carry, so at most 9999.99.
pub const MONEY_PRECISION: u32 = 6;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptSummary {
    pub image_id: String,
    pub vendor_name: String,
    pub receiver_address: String,
    pub receipt_date: DateTime<Utc>,
    pub total: Decimal,
    pub sub_total: Decimal,
    pub tax_amount: Decimal,
    pub currency: String,
    pub other_fields: BTreeMap<String, String>,
    #[serde(default)]
    pub line_items: Vec<ReceiptLineItem>,
}

impl ReceiptSummary {
    pub fn new(image_id: impl Into<String>) -> Self {
        Self {
            image_id: image_id.into(),
            vendor_name: DEFAULT_VENDOR.into(),
            receiver_address: DEFAULT_VENDOR.into(),
            receipt_date: Utc::now(),
            total: Decimal::ZERO,
            sub_total: Decimal::ZERO,
            tax_amount: Decimal::ZERO,
            currency: DEFAULT_CURRENCY.into(),
            other_fields: BTreeMap::new(),
            line_items: Vec::new(),
        }
    }
}

/// A single purchased item, owned by the `ReceiptSummary` with the same `image_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptLineItem {
    pub image_id: String,
    pub item_name: String,
    pub price: Decimal,
    pub quantity: u32,
}

impl ReceiptLineItem {
    pub fn new(image_id: impl Into<String>) -> Self {
        Self {
            image_id: image_id.into(),
            item_name: DEFAULT_VENDOR.into(),
            price: Decimal::ZERO,
            quantity: 1,
        }
    }
}

/// Row shape returned when reading summaries back from the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredReceipt {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub summary: ReceiptSummary,
}
