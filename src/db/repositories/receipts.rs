use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, Row};

use crate::db::{
    connection::Database,
    helpers::{parse_datetime, parse_decimal, parse_other_fields, to_u32},
    models::{ReceiptLineItem, ReceiptSummary, StoredReceipt},
};

fn row_to_receipt(row: &Row) -> Result<StoredReceipt> {
    let receipt_date: String = row.get("receipt_date")?;
    let created_at: String = row.get("created_at")?;
    let total: String = row.get("total")?;
    let sub_total: String = row.get("sub_total")?;
    let tax_amnt: String = row.get("tax_amnt")?;
    let other_fields_json: String = row.get("other_fields_json")?;

    Ok(StoredReceipt {
        id: row.get("id")?,
        created_at: parse_datetime(&created_at, "created_at")?,
        summary: ReceiptSummary {
            image_id: row.get("img_id")?,
            vendor_name: row.get("vendor_name")?,
            receiver_address: row.get("receiver_address")?,
            receipt_date: parse_datetime(&receipt_date, "receipt_date")?,
            total: parse_decimal(&total, "total")?,
            sub_total: parse_decimal(&sub_total, "sub_total")?,
            tax_amount: parse_decimal(&tax_amnt, "tax_amnt")?,
            currency: row.get("currency")?,
            other_fields: parse_other_fields(&other_fields_json)?,
            line_items: Vec::new(),
        },
    })
}

fn line_items_for(conn: &Connection, summary_id: i64) -> Result<Vec<ReceiptLineItem>> {
    let mut stmt = conn.prepare(
        "SELECT img_id, item_name, price, quantity
         FROM receipt_line_items
         WHERE summary_id = ?1
         ORDER BY id ASC",
    )?;

    let mut rows = stmt.query(params![summary_id])?;
    let mut items = Vec::new();
    while let Some(row) = rows.next()? {
        let price: String = row.get(2)?;
        items.push(ReceiptLineItem {
            image_id: row.get(0)?,
            item_name: row.get(1)?,
            price: parse_decimal(&price, "price")?,
            quantity: to_u32(row.get(3)?, "quantity")?,
        });
    }
    Ok(items)
}

impl Database {
    /// Insert a batch of summaries (with their line items) in one transaction.
    /// Either every row lands or none do.
    pub async fn insert_receipts(&self, receipts: &[ReceiptSummary]) -> Result<usize> {
        let records = receipts.to_vec();
        self.execute(move |conn| {
            let tx = conn
                .transaction()
                .context("failed to open receipt batch transaction")?;
            let created_at = Utc::now().to_rfc3339();

            for record in &records {
                let other_fields_json = serde_json::to_string(&record.other_fields)
                    .context("failed to serialize other_fields")?;

                tx.execute(
                    "INSERT INTO receipt_summaries (
                        img_id,
                        vendor_name,
                        receiver_address,
                        receipt_date,
                        total,
                        sub_total,
                        tax_amnt,
                        currency,
                        other_fields_json,
                        created_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        record.image_id,
                        record.vendor_name,
                        record.receiver_address,
                        record.receipt_date.to_rfc3339(),
                        record.total.to_string(),
                        record.sub_total.to_string(),
                        record.tax_amount.to_string(),
                        record.currency,
                        other_fields_json,
                        created_at,
                    ],
                )
                .with_context(|| format!("failed to insert receipt {}", record.image_id))?;

                let summary_id = tx.last_insert_rowid();
                for item in &record.line_items {
                    tx.execute(
                        "INSERT INTO receipt_line_items (summary_id, img_id, item_name, price, quantity)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            summary_id,
                            item.image_id,
                            item.item_name,
                            item.price.to_string(),
                            i64::from(item.quantity),
                        ],
                    )
                    .with_context(|| {
                        format!("failed to insert line item for {}", record.image_id)
                    })?;
                }
            }

            tx.commit().context("failed to commit receipt batch")?;
            Ok(records.len())
        })
        .await
    }

    /// Most recent receipts first.
    pub async fn get_receipts(&self, limit: u32) -> Result<Vec<StoredReceipt>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, img_id, vendor_name, receiver_address, receipt_date, total,
                        sub_total, tax_amnt, currency, other_fields_json, created_at
                 FROM receipt_summaries
                 ORDER BY id DESC
                 LIMIT ?1",
            )?;

            let mut rows = stmt.query(params![limit])?;
            let mut receipts = Vec::new();
            while let Some(row) = rows.next()? {
                receipts.push(row_to_receipt(row)?);
            }

            for receipt in &mut receipts {
                receipt.summary.line_items = line_items_for(conn, receipt.id)?;
            }

            Ok(receipts)
        })
        .await
    }

    pub async fn count_receipts(&self) -> Result<u64> {
        self.execute(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM receipt_summaries", [], |row| {
                    row.get(0)
                })?;
            Ok(count.max(0) as u64)
        })
        .await
    }
}
