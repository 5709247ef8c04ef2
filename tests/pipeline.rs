use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use image::{ImageBuffer, Luma};
use tokio_util::sync::CancellationToken;

use receiptwatch_lib::analysis::{
    AnalysisError, Document, ExpenseAnalysis, ExpenseAnalyzer, ExpenseField,
};
use receiptwatch_lib::app::ReceiptPipeline;
use receiptwatch_lib::config::PipelineConfig;
use receiptwatch_lib::db::{Database, ReceiptSummary};
use receiptwatch_lib::ingest::AnalysisIngestHandler;
use receiptwatch_lib::pipeline::{bounded, BatchWriter, ReceiptSink, WorkQueueEntry};

struct CannedAnalyzer;

#[async_trait]
impl ExpenseAnalyzer for CannedAnalyzer {
    async fn analyze(&self, _document: Document) -> Result<ExpenseAnalysis, AnalysisError> {
        Ok(ExpenseAnalysis {
            summary_fields: vec![
                ExpenseField::new("VENDOR_NAME", None, "Green Grocer"),
                ExpenseField::new("INVOICE_RECEIPT_DATE", None, "03/14/2024"),
                ExpenseField::new("TOTAL", Some("Total"), "$1,234.50 (TOTAL)"),
                ExpenseField::new("OTHER", Some("Cashier"), "Jane"),
            ],
            line_items: vec![
                vec!["Apples".into(), "$3.20".into(), "3".into()],
                vec!["Bread".into(), "$2.00".into()],
            ],
        })
    }
}

#[derive(Default)]
struct RecordingSink {
    batches: Mutex<Vec<Vec<ReceiptSummary>>>,
    failures_left: Mutex<u32>,
}

impl RecordingSink {
    fn failing_first(times: u32) -> Self {
        Self {
            failures_left: Mutex::new(times),
            ..Self::default()
        }
    }

    fn batches(&self) -> Vec<Vec<ReceiptSummary>> {
        self.batches.lock().unwrap().clone()
    }

    fn receipt_count(&self) -> usize {
        self.batches.lock().unwrap().iter().map(Vec::len).sum()
    }
}

#[async_trait]
impl ReceiptSink for RecordingSink {
    async fn insert_many(&self, receipts: &[ReceiptSummary]) -> anyhow::Result<usize> {
        {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(anyhow!("database is locked"));
            }
        }
        self.batches.lock().unwrap().push(receipts.to_vec());
        Ok(receipts.len())
    }
}

/// 64x64 image whose 8x8 blocks are black or white according to `pattern`,
/// so every pattern hashes differently.
fn write_scan(path: &Path, pattern: u64) {
    let img = ImageBuffer::from_fn(64, 64, |x, y| {
        let bit = (y / 8) * 8 + (x / 8);
        if pattern >> bit & 1 == 1 {
            Luma([255u8])
        } else {
            Luma([0u8])
        }
    });
    img.save(path).unwrap();
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(20), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

fn fast_config(watch: &Path, staging: &Path) -> PipelineConfig {
    PipelineConfig {
        watch_dir: Some(watch.to_path_buf()),
        staging_dir: Some(staging.to_path_buf()),
        stable_poll_ms: 50,
        writer_poll_ms: 100,
        pause_for_secs: 1,
        ..PipelineConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scans_flow_from_watch_dir_to_sink() {
    let dir = tempfile::tempdir().unwrap();
    let watch = dir.path().join("scans");
    let staging = dir.path().join("staging");
    std::fs::create_dir_all(&watch).unwrap();
    std::fs::create_dir_all(&staging).unwrap();

    let sink = Arc::new(RecordingSink::default());
    let mut pipeline = ReceiptPipeline::build(
        &fast_config(&watch, &staging),
        Arc::new(CannedAnalyzer),
        sink.clone(),
    )
    .unwrap();
    pipeline.start().unwrap();
    let shutdown = pipeline.shutdown_token();
    let running = tokio::spawn(pipeline.run());

    let patterns = [0x0F0F_0F0F_0F0F_0F0F, 0x3333_3333_3333_3333, 0x5555_5555_5555_5555];
    for (i, pattern) in patterns.iter().enumerate() {
        write_scan(&watch.join(format!("Scan_{i}.png")), *pattern);
    }

    wait_until("three stored receipts", || sink.receipt_count() == 3).await;
    shutdown.cancel();
    let stats = running.await.unwrap().unwrap();

    assert_eq!(stats.receipts_written, 3);
    assert_eq!(std::fs::read_dir(&watch).unwrap().count(), 0);
    assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 3);

    let stored: Vec<ReceiptSummary> = sink.batches().into_iter().flatten().collect();
    for summary in &stored {
        assert_eq!(summary.image_id.len(), 16);
        assert!(staging.join(format!("{}.png", summary.image_id)).exists());
        assert_eq!(summary.vendor_name, "Green Grocer");
        assert_eq!(summary.total.to_string(), "1234.50");
        assert_eq!(summary.currency, "US Dollars");
        assert_eq!(summary.other_fields.get("Cashier").map(String::as_str), Some("Jane"));
        assert_eq!(summary.line_items.len(), 2);
        assert_eq!(summary.line_items[0].quantity, 3);
        assert_eq!(summary.line_items[1].quantity, 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn flush_marker_fires_before_the_queue_fills() {
    let dir = tempfile::tempdir().unwrap();
    let watch = dir.path().join("scans");
    let staging = dir.path().join("staging");
    std::fs::create_dir_all(&watch).unwrap();
    std::fs::create_dir_all(&staging).unwrap();

    // An hour-long poll means only a flush marker can trigger the write.
    let config = PipelineConfig {
        queue_capacity: 3,
        writer_poll_ms: 3_600_000,
        ..fast_config(&watch, &staging)
    };
    let sink = Arc::new(RecordingSink::default());
    let mut pipeline =
        ReceiptPipeline::build(&config, Arc::new(CannedAnalyzer), sink.clone()).unwrap();
    pipeline.start().unwrap();
    let shutdown = pipeline.shutdown_token();
    let running = tokio::spawn(pipeline.run());

    write_scan(&watch.join("a.png"), 0x00FF_00FF_00FF_00FF);
    write_scan(&watch.join("b.png"), 0x0F0F_0F0F_F0F0_F0F0);

    wait_until("a sentinel-driven flush", || sink.batches().len() == 1).await;
    assert_eq!(sink.batches()[0].len(), 2);

    shutdown.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn fewer_than_capacity_reach_the_sink_in_order_in_one_batch() {
    let dir = tempfile::tempdir().unwrap();
    let (producer, consumer) = bounded(10).unwrap();
    let handler = AnalysisIngestHandler::new(Arc::new(CannedAnalyzer), producer, Duration::from_secs(5));
    let sink = Arc::new(RecordingSink::default());

    let ids = ["aaaa", "bbbb", "cccc", "dddd", "eeee"];
    for id in ids {
        let path = dir.path().join(format!("{id}.png"));
        std::fs::write(&path, b"bytes").unwrap();
        handler.process(&path).await;
    }
    drop(handler);

    let stats = BatchWriter::new(consumer, sink.clone(), Duration::from_millis(50))
        .run(CancellationToken::new())
        .await;

    let batches = sink.batches();
    assert_eq!(batches.len(), 1);
    let order: Vec<&str> = batches[0].iter().map(|s| s.image_id.as_str()).collect();
    assert_eq!(order, ids);
    assert_eq!(stats.batches_written, 1);
}

#[tokio::test]
async fn writer_survives_a_failed_flush() {
    let (producer, consumer) = bounded(10).unwrap();
    let sink = Arc::new(RecordingSink::failing_first(1));
    let writer = BatchWriter::new(consumer, sink.clone(), Duration::from_millis(50))
        .spawn(CancellationToken::new());

    producer
        .put(WorkQueueEntry::receipt(ReceiptSummary::new("first")))
        .await
        .unwrap();
    producer.put(WorkQueueEntry::Flush).await.unwrap();
    producer
        .put(WorkQueueEntry::receipt(ReceiptSummary::new("second")))
        .await
        .unwrap();
    producer.put(WorkQueueEntry::Flush).await.unwrap();

    wait_until("the second batch", || sink.batches().len() == 1).await;
    drop(producer);
    let stats = writer.await.unwrap();

    assert_eq!(sink.batches()[0][0].image_id, "second");
    assert_eq!(stats.batches_failed, 1);
    assert_eq!(stats.receipts_written, 1);
}

#[tokio::test]
async fn sqlite_sink_persists_batches() {
    let dir = tempfile::tempdir().unwrap();
    let database = Arc::new(Database::new(dir.path().join("receipts.sqlite3")).unwrap());
    let (producer, consumer) = bounded(4).unwrap();
    let handler =
        AnalysisIngestHandler::new(Arc::new(CannedAnalyzer), producer, Duration::from_secs(5));

    for id in ["0001", "0002"] {
        let path = dir.path().join(format!("{id}.jpg"));
        std::fs::write(&path, b"bytes").unwrap();
        handler.process(&path).await;
    }
    drop(handler);

    BatchWriter::new(consumer, database.clone(), Duration::from_millis(50))
        .run(CancellationToken::new())
        .await;

    assert_eq!(database.count_receipts().await.unwrap(), 2);
    let stored = database.get_receipts(10).await.unwrap();
    assert_eq!(stored[0].summary.image_id, "0002");
    assert_eq!(stored[0].summary.line_items.len(), 2);
    assert_eq!(stored[1].summary.other_fields["Cashier"], "Jane");
}
