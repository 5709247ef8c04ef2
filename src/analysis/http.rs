use async_trait::async_trait;
use log::debug;
use serde_json::json;

use super::{textract, AnalysisError, Document, ExpenseAnalysis, ExpenseAnalyzer};

/// Talks to an analysis endpoint that answers with AnalyzeExpense-shaped JSON.
///
/// Image bytes are posted as `application/octet-stream`; bucket references are
/// posted as `{"Document": {"S3Object": {"Bucket": .., "Name": ..}}}`.
#[derive(Debug, Clone)]
pub struct HttpExpenseAnalyzer {
    client: reqwest::Client,
    endpoint: Option<String>,
}

impl HttpExpenseAnalyzer {
    pub fn new(endpoint: Option<String>) -> Result<Self, AnalysisError> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }
}

#[async_trait]
impl ExpenseAnalyzer for HttpExpenseAnalyzer {
    async fn analyze(&self, document: Document) -> Result<ExpenseAnalysis, AnalysisError> {
        let endpoint = self.endpoint.as_deref().ok_or(AnalysisError::NotConfigured)?;

        let request = match document {
            Document::Bytes(bytes) => {
                debug!("posting {} image bytes to {endpoint}", bytes.len());
                self.client
                    .post(endpoint)
                    .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                    .body(bytes)
            }
            Document::S3Object { bucket, key } => {
                debug!("requesting analysis of {bucket}/{key} from {endpoint}");
                self.client.post(endpoint).json(&json!({
                    "Document": { "S3Object": { "Bucket": bucket, "Name": key } }
                }))
            }
        };

        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            return Err(AnalysisError::Service {
                status: status.as_u16(),
                message: String::from_utf8_lossy(&body).trim().to_string(),
            });
        }

        Ok(textract::parse_response(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_endpoint_is_not_configured() {
        let analyzer = HttpExpenseAnalyzer::new(None).unwrap();
        let err = analyzer
            .analyze(Document::Bytes(vec![1, 2, 3]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "NotConfigured");
    }
}
