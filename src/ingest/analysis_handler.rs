use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, error, info};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::phash::is_supported_image;
use crate::analysis::{image_id_for, summarize, AnalysisError, Document, ExpenseAnalyzer, ParseError};
use crate::db::ReceiptSummary;
use crate::pipeline::{QueueError, QueueProducer, WorkQueueEntry};
use crate::watcher::{EventHandler, FileEvent};

pub const DEFAULT_ANALYSIS_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisState {
    Idle,
    Analyzing,
    Enqueued,
    Failed,
}

#[derive(Debug, Error)]
pub enum AnalysisFailure {
    #[error("failed to read image: {0}")]
    Read(#[from] io::Error),
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl AnalysisFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            AnalysisFailure::Read(_) => "Read",
            AnalysisFailure::Analysis(err) => err.kind(),
            AnalysisFailure::Parse(err) => err.kind(),
            AnalysisFailure::Queue(_) => "QueueClosed",
        }
    }
}

/// Sends every staged image to the analyzer and queues the resulting summary
/// for the batch writer.
///
/// A flush marker follows every `capacity - 1` receipts, so the queue never
/// fills up with receipts alone.
pub struct AnalysisIngestHandler {
    analyzer: Arc<dyn ExpenseAnalyzer>,
    producer: QueueProducer,
    timeout: Duration,
    since_flush: Mutex<usize>,
}

impl AnalysisIngestHandler {
    pub fn new(analyzer: Arc<dyn ExpenseAnalyzer>, producer: QueueProducer, timeout: Duration) -> Self {
        Self {
            analyzer,
            producer,
            timeout,
            since_flush: Mutex::new(0),
        }
    }

    /// Receipts queued since the last flush marker.
    pub async fn since_flush(&self) -> usize {
        *self.since_flush.lock().await
    }

    /// Analyze one staged image. Ends in `Enqueued` or `Failed`; a failure is
    /// logged and the image is not retried.
    pub async fn process(&self, image_path: &Path) -> AnalysisState {
        let mut state = AnalysisState::Idle;
        let mut summary = None;

        loop {
            state = match state {
                AnalysisState::Idle => AnalysisState::Analyzing,
                AnalysisState::Analyzing => match self.analyze(image_path).await {
                    Ok(parsed) => {
                        summary = Some(parsed);
                        AnalysisState::Enqueued
                    }
                    Err(err) => {
                        self.log_failure(image_path, &err);
                        AnalysisState::Failed
                    }
                },
                AnalysisState::Enqueued => {
                    let Some(parsed) = summary.take() else {
                        return AnalysisState::Enqueued;
                    };
                    let image_id = parsed.image_id.clone();
                    let vendor = parsed.vendor_name.clone();
                    if let Err(err) = self.enqueue(parsed).await {
                        self.log_failure(image_path, &AnalysisFailure::from(err));
                        return AnalysisState::Failed;
                    }
                    info!("Queued receipt {image_id} from {vendor}");
                    return AnalysisState::Enqueued;
                }
                AnalysisState::Failed => return AnalysisState::Failed,
            };
        }
    }

    async fn analyze(&self, image_path: &Path) -> Result<ReceiptSummary, AnalysisFailure> {
        let bytes = tokio::fs::read(image_path).await?;
        let analysis = tokio::time::timeout(self.timeout, self.analyzer.analyze(Document::Bytes(bytes)))
            .await
            .map_err(|_| AnalysisError::Timeout(self.timeout))??;
        Ok(summarize(&image_id_for(image_path), &analysis)?)
    }

    async fn enqueue(&self, summary: ReceiptSummary) -> Result<(), QueueError> {
        let mut since_flush = self.since_flush.lock().await;

        self.producer.put(WorkQueueEntry::receipt(summary)).await?;
        *since_flush += 1;
        debug!("{} receipts queued since last flush", *since_flush);

        if *since_flush >= self.producer.capacity().saturating_sub(1) {
            debug!("queue near capacity, inserting flush marker");
            self.producer.put(WorkQueueEntry::Flush).await?;
            *since_flush = 0;
        }
        Ok(())
    }

    fn log_failure(&self, image_path: &Path, err: &AnalysisFailure) {
        let name = image_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| image_path.display().to_string());
        error!("({name}) {}: {err}", err.kind());
    }
}

#[async_trait]
impl EventHandler for AnalysisIngestHandler {
    fn name(&self) -> &str {
        "receipt-analyzer"
    }

    async fn on_created(&self, event: &FileEvent, _shutdown: &CancellationToken) -> Result<()> {
        if event.is_dir || event.is_hidden() {
            return Ok(());
        }
        if !is_supported_image(&event.path) {
            debug!("ignoring non-image file {}", event.path.display());
            return Ok(());
        }
        self.process(&event.path).await;
        Ok(())
    }
}
