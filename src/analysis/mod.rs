//! Contract with the remote document-analysis service.
//!
//! The service receives receipt image bytes (or a reference to an object in a
//! bucket) and answers with typed key/value fields. Everything downstream works
//! on [`ExpenseAnalysis`], never on the service's wire format.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::ReceiptSummary;

pub mod http;
pub mod parse;
pub mod textract;

pub use http::HttpExpenseAnalyzer;
pub use parse::{summarize, ParseError};

/// What to analyze.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Document {
    Bytes(Vec<u8>),
    S3Object { bucket: String, key: String },
}

/// One summary field as returned by the service.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseField {
    pub field_type: String,
    pub field_type_confidence: Option<f32>,
    pub label_text: Option<String>,
    pub label_confidence: Option<f32>,
    pub value_text: String,
    pub value_confidence: Option<f32>,
}

impl ExpenseField {
    pub fn new(field_type: &str, label_text: Option<&str>, value_text: &str) -> Self {
        Self {
            field_type: field_type.to_string(),
            label_text: label_text.map(str::to_string),
            value_text: value_text.to_string(),
            ..Self::default()
        }
    }
}

/// Columns of one line item: `[name, price, quantity]`. Columns may be missing.
pub type LineItemRow = Vec<String>;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseAnalysis {
    pub summary_fields: Vec<ExpenseField>,
    #[serde(default)]
    pub line_items: Vec<LineItemRow>,
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("analysis service is not configured")]
    NotConfigured,
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("analysis service returned {status}: {message}")]
    Service { status: u16, message: String },
    #[error("malformed analysis response: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("analysis did not finish within {0:?}")]
    Timeout(Duration),
}

impl AnalysisError {
    pub fn kind(&self) -> &'static str {
        match self {
            AnalysisError::NotConfigured => "NotConfigured",
            AnalysisError::Transport(_) => "Transport",
            AnalysisError::Service { .. } => "Service",
            AnalysisError::Malformed(_) => "Malformed",
            AnalysisError::Timeout(_) => "Timeout",
        }
    }
}

#[async_trait]
pub trait ExpenseAnalyzer: Send + Sync {
    async fn analyze(&self, document: Document) -> Result<ExpenseAnalysis, AnalysisError>;
}

/// Image id of a staged file: its stem, which is the content hash.
pub fn image_id_for(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Analyze a local image and map the result into a summary.
pub async fn analyze_local(
    analyzer: &dyn ExpenseAnalyzer,
    image_path: &Path,
) -> anyhow::Result<ReceiptSummary> {
    use anyhow::Context;

    let bytes = tokio::fs::read(image_path)
        .await
        .with_context(|| format!("failed to read {}", image_path.display()))?;
    let analysis = analyzer.analyze(Document::Bytes(bytes)).await?;
    Ok(summarize(&image_id_for(image_path), &analysis)?)
}

/// Analyze an object already stored in a bucket.
pub async fn analyze_object(
    analyzer: &dyn ExpenseAnalyzer,
    key: &str,
    bucket: &str,
) -> anyhow::Result<ReceiptSummary> {
    let analysis = analyzer
        .analyze(Document::S3Object {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
        .await?;
    Ok(summarize(&image_id_for(Path::new(key)), &analysis)?)
}
