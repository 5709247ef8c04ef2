use std::{collections::BTreeMap, convert::TryFrom, str::FromStr};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

pub fn to_u32(value: i64, field: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| anyhow!("{field} contains out of range value {value}"))
}

pub fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("failed to parse {field}"))
}

/// Decimals are stored as TEXT so the fixed-point value survives SQLite's REAL affinity.
pub fn parse_decimal(value: &str, field: &str) -> Result<Decimal> {
    Decimal::from_str(value).with_context(|| format!("failed to parse {field} '{value}'"))
}

pub fn parse_other_fields(value: &str) -> Result<BTreeMap<String, String>> {
    serde_json::from_str(value).context("failed to parse other_fields_json")
}
