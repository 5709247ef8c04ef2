//! Serde model of an AnalyzeExpense response and its flattening into
//! [`ExpenseAnalysis`].

use serde::Deserialize;

use super::{ExpenseAnalysis, ExpenseField, LineItemRow};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AnalyzeExpenseResponse {
    #[serde(default)]
    pub expense_documents: Vec<ExpenseDocument>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExpenseDocument {
    #[serde(default)]
    pub summary_fields: Vec<TextractField>,
    #[serde(default)]
    pub line_item_groups: Vec<LineItemGroup>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TextractField {
    #[serde(rename = "Type")]
    pub field_type: Option<Detection>,
    pub label_detection: Option<Detection>,
    pub value_detection: Option<Detection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Detection {
    pub text: Option<String>,
    pub confidence: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LineItemGroup {
    #[serde(default)]
    pub line_items: Vec<LineItem>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LineItem {
    #[serde(default)]
    pub line_item_expense_fields: Vec<TextractField>,
}

impl TextractField {
    fn type_text(&self) -> &str {
        self.field_type
            .as_ref()
            .and_then(|detection| detection.text.as_deref())
            .unwrap_or("")
    }

    fn value_text(&self) -> &str {
        self.value_detection
            .as_ref()
            .and_then(|detection| detection.text.as_deref())
            .unwrap_or("")
    }
}

impl From<&TextractField> for ExpenseField {
    fn from(field: &TextractField) -> Self {
        ExpenseField {
            field_type: field.type_text().to_string(),
            field_type_confidence: field.field_type.as_ref().and_then(|d| d.confidence),
            label_text: field
                .label_detection
                .as_ref()
                .and_then(|d| d.text.clone()),
            label_confidence: field.label_detection.as_ref().and_then(|d| d.confidence),
            value_text: field.value_text().to_string(),
            value_confidence: field.value_detection.as_ref().and_then(|d| d.confidence),
        }
    }
}

fn line_item_row(item: &LineItem) -> LineItemRow {
    let column = |kind: &str| {
        item.line_item_expense_fields
            .iter()
            .find(|field| field.type_text() == kind)
            .map(|field| field.value_text().to_string())
    };

    let name = column("ITEM")
        .or_else(|| column("EXPENSE_ROW"))
        .unwrap_or_default();
    let mut row = vec![name, column("PRICE").unwrap_or_default()];
    if let Some(quantity) = column("QUANTITY") {
        row.push(quantity);
    }
    row
}

impl From<AnalyzeExpenseResponse> for ExpenseAnalysis {
    fn from(response: AnalyzeExpenseResponse) -> Self {
        let summary_fields = response
            .expense_documents
            .iter()
            .flat_map(|document| document.summary_fields.iter())
            .map(ExpenseField::from)
            .collect();

        let line_items = response
            .expense_documents
            .iter()
            .flat_map(|document| document.line_item_groups.iter())
            .flat_map(|group| group.line_items.iter())
            .map(line_item_row)
            .collect();

        ExpenseAnalysis {
            summary_fields,
            line_items,
        }
    }
}

pub fn parse_response(body: &[u8]) -> Result<ExpenseAnalysis, serde_json::Error> {
    let response: AnalyzeExpenseResponse = serde_json::from_slice(body)?;
    Ok(response.into())
}
