//! Maps analysis fields onto a [`ReceiptSummary`].
//!
//! Pure functions only. Money never goes through floating point; amounts are
//! parsed straight into `Decimal` and rescaled to two places.

use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use rust_decimal::Decimal;
use thiserror::Error;

use super::{ExpenseAnalysis, ExpenseField};
use crate::db::models::receipt::{DEFAULT_VENDOR, MONEY_PRECISION, MONEY_SCALE};
use crate::db::{ReceiptLineItem, ReceiptSummary};

pub const US_DOLLARS: &str = "US Dollars";

static MONEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<currency>[£$€])?\s*(?P<amount>\d[,\d]*(?:\.\d+)?)")
        .expect("money regex is valid")
});

// Field tags such as "(TOTAL)" that the service appends to rendered values.
static FIELD_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\([A-Z_]+\)").expect("field tag regex is valid"));

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%m/%d/%Y %I:%M %p",
    "%m/%d/%y %H:%M",
    "%d/%m/%Y %H:%M",
];

// Month-first before day-first: an ambiguous "03/04/2024" reads as March 4th.
const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%m/%d/%Y",
    "%m-%d-%Y",
    "%m/%d/%y",
    "%m-%d-%y",
    "%d/%m/%Y",
    "%d-%m-%Y",
    "%d.%m.%Y",
    "%d.%m.%y",
    "%d/%m/%y",
    "%b %d, %Y",
    "%b %d %Y",
    "%B %d, %Y",
    "%B %d %Y",
    "%d %b %Y",
    "%d %B %Y",
    "%d-%b-%Y",
    "%d-%b-%y",
    "%a, %b %d, %Y",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unrecognized receipt date '{0}'")]
    InvalidDate(String),
    #[error("amount '{0}' does not fit in a money column")]
    AmountOutOfRange(String),
}

impl ParseError {
    pub fn kind(&self) -> &'static str {
        match self {
            ParseError::InvalidDate(_) => "InvalidDate",
            ParseError::AmountOutOfRange(_) => "AmountOutOfRange",
        }
    }
}

/// A parsed money token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Money {
    pub amount: Decimal,
    pub symbol: Option<char>,
}

impl Money {
    pub const ZERO: Money = Money {
        amount: Decimal::ZERO,
        symbol: None,
    };
}

/// Summary field classes the mapping understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldClass {
    VendorName,
    ReceiverAddress,
    InvoiceReceiptDate,
    Subtotal,
    Total,
    Tax,
    Other,
}

impl FieldClass {
    pub fn classify(field_type: &str, label_text: Option<&str>) -> Self {
        match field_type.trim() {
            "VENDOR_NAME" => FieldClass::VendorName,
            "RECEIVER_ADDRESS" => FieldClass::ReceiverAddress,
            "INVOICE_RECEIPT_DATE" => FieldClass::InvoiceReceiptDate,
            "SUBTOTAL" => FieldClass::Subtotal,
            "TOTAL" => FieldClass::Total,
            "TAX" => FieldClass::Tax,
            _ if label_text.map(str::trim) == Some("Total") => FieldClass::Total,
            _ => FieldClass::Other,
        }
    }
}

/// Drop "(TAG)" markers and surrounding whitespace.
pub fn clean_value(raw: &str) -> String {
    FIELD_TAG_RE.replace_all(raw, "").trim().to_string()
}

/// Parse the first money token in `raw`. Unparseable input is zero.
pub fn parse_money(raw: &str) -> Money {
    let cleaned = clean_value(raw);
    let Some(caps) = MONEY_RE.captures(&cleaned) else {
        return Money::ZERO;
    };

    let digits: String = caps["amount"].chars().filter(|c| *c != ',').collect();
    let Ok(mut amount) = Decimal::from_str(&digits) else {
        return Money::ZERO;
    };
    amount.rescale(MONEY_SCALE);

    Money {
        amount,
        symbol: caps
            .name("currency")
            .and_then(|symbol| symbol.as_str().chars().next()),
    }
}

/// [`parse_money`] limited to the stored digit budget.
pub fn parse_amount(raw: &str) -> Result<Decimal, ParseError> {
    let amount = parse_money(raw).amount;
    let limit = Decimal::new(10_i64.pow(MONEY_PRECISION), MONEY_SCALE);
    if amount.abs() >= limit {
        return Err(ParseError::AmountOutOfRange(clean_value(raw)));
    }
    Ok(amount)
}

/// Quantities must be whole and at least one; anything else counts as one.
pub fn parse_quantity(raw: Option<&str>) -> u32 {
    raw.map(clean_value)
        .and_then(|value| value.parse::<u32>().ok())
        .filter(|quantity| *quantity >= 1)
        .unwrap_or(1)
}

/// Permissive date parsing. Dates without a time are midnight UTC.
pub fn parse_receipt_date(raw: &str) -> Result<DateTime<Utc>, ParseError> {
    let value = clean_value(raw).replace('\n', " ");
    let value = value.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }

    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }

    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            if let Some(naive) = date.and_hms_opt(0, 0, 0) {
                return Ok(Utc.from_utc_datetime(&naive));
            }
        }
    }

    Err(ParseError::InvalidDate(value.to_string()))
}

/// Build a line item from `[name, price, quantity]` columns.
pub fn parse_line_item_row(image_id: &str, columns: &[String]) -> Result<ReceiptLineItem, ParseError> {
    let mut item = ReceiptLineItem::new(image_id);

    if let Some(name) = columns.first().map(|value| clean_value(value)) {
        if !name.is_empty() {
            item.item_name = name;
        }
    }
    item.price = match columns.get(1) {
        Some(value) => parse_amount(value)?,
        None => Decimal::ZERO,
    };
    item.quantity = parse_quantity(columns.get(2).map(String::as_str));

    Ok(item)
}

fn other_field_key(field: &ExpenseField) -> String {
    field
        .label_text
        .as_deref()
        .map(str::trim)
        .filter(|label| !label.is_empty())
        .unwrap_or(field.field_type.trim())
        .to_string()
}

/// Map an analysis result onto a summary for `image_id`.
///
/// An unparseable date or an amount over the digit budget fails the whole
/// record; money that cannot be read is recorded as zero.
pub fn summarize(image_id: &str, analysis: &ExpenseAnalysis) -> Result<ReceiptSummary, ParseError> {
    let mut summary = ReceiptSummary::new(image_id);

    for field in &analysis.summary_fields {
        let raw = field.value_text.as_str();
        if raw.contains('$') {
            summary.currency = US_DOLLARS.to_string();
        }

        match FieldClass::classify(&field.field_type, field.label_text.as_deref()) {
            FieldClass::VendorName => summary.vendor_name = text_or_default(raw),
            FieldClass::ReceiverAddress => summary.receiver_address = text_or_default(raw),
            FieldClass::InvoiceReceiptDate => summary.receipt_date = parse_receipt_date(raw)?,
            FieldClass::Subtotal => summary.sub_total = parse_amount(raw)?,
            FieldClass::Total => summary.total = parse_amount(raw)?,
            FieldClass::Tax => summary.tax_amount = parse_amount(raw)?,
            FieldClass::Other => {
                summary
                    .other_fields
                    .insert(other_field_key(field), raw.trim().to_string());
            }
        }
    }

    summary.line_items = analysis
        .line_items
        .iter()
        .filter(|row| row.iter().any(|column| !column.trim().is_empty()))
        .map(|row| parse_line_item_row(image_id, row))
        .collect::<Result<_, _>>()?;

    Ok(summary)
}

fn text_or_default(raw: &str) -> String {
    let value = clean_value(raw).replace('\n', " ");
    if value.is_empty() {
        DEFAULT_VENDOR.to_string()
    } else {
        value
    }
}
