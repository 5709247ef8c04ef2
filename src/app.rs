//! Wiring of the watch pipeline and the command implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::{info, warn};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::analysis::{
    analyze_local, analyze_object, image_id_for, ExpenseAnalyzer, HttpExpenseAnalyzer,
};
use crate::cli::{AnalyzeSource, Command};
use crate::config::PipelineConfig;
use crate::db::Database;
use crate::ingest::phash::{compute_image_hash, hash_and_rename};
use crate::ingest::{
    AnalysisIngestHandler, DirectoryBucket, ImageIngestHandler, MoveToBucketHandler,
    StableFileWaiter,
};
use crate::pipeline::{bounded, BatchWriter, ReceiptSink, WriterStats};
use crate::watcher::{WatchSupervisor, WatchedDirectory};

/// Watch dir -> image handler -> staging dir -> analysis handler -> queue -> writer.
pub struct ReceiptPipeline {
    supervisor: WatchSupervisor,
    writer: JoinHandle<WriterStats>,
    staging_dir: PathBuf,
    // Removed on drop; only set when no staging dir was configured.
    temp_staging: Option<TempDir>,
}

impl ReceiptPipeline {
    /// Validate `config`, start the batch writer and register both watches.
    /// Nothing is observed until [`ReceiptPipeline::run`].
    pub fn build(
        config: &PipelineConfig,
        analyzer: Arc<dyn ExpenseAnalyzer>,
        sink: Arc<dyn ReceiptSink>,
    ) -> Result<Self> {
        let watch_dir = config.validate_for_watch()?.to_path_buf();

        let (temp_staging, staging_dir) = match &config.staging_dir {
            Some(dir) => (None, dir.clone()),
            None => {
                let temp = tempfile::Builder::new()
                    .prefix("receiptwatch-staging-")
                    .tempdir()
                    .context("failed to create temporary staging directory")?;
                let path = temp.path().to_path_buf();
                (Some(temp), path)
            }
        };

        let (producer, consumer) = bounded(config.queue_capacity)?;

        let image_handler = ImageIngestHandler::new(
            StableFileWaiter::new(config.stable_poll()),
            Some(staging_dir.clone()),
        );
        let analysis_handler =
            AnalysisIngestHandler::new(analyzer, producer, config.analysis_timeout());

        let mut supervisor = WatchSupervisor::new(config.pause_for());
        supervisor.watch(WatchedDirectory::new(watch_dir, Arc::new(image_handler)))?;
        supervisor.watch(WatchedDirectory::new(
            staging_dir.clone(),
            Arc::new(analysis_handler),
        ))?;

        // The writer stops by itself once every producer is gone.
        let writer =
            BatchWriter::new(consumer, sink, config.writer_poll()).spawn(CancellationToken::new());

        Ok(Self {
            supervisor,
            writer,
            staging_dir,
            temp_staging,
        })
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Begin observing both directories ahead of [`ReceiptPipeline::run`].
    pub fn start(&mut self) -> Result<()> {
        self.supervisor.start()
    }

    /// Cancelling this token stops the pipeline like Ctrl-C does.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.supervisor.shutdown_token()
    }

    /// Runs until Ctrl-C or the shutdown token. The writer then flushes what
    /// is left in the queue before this returns.
    pub async fn run(self) -> Result<WriterStats> {
        let Self {
            mut supervisor,
            writer,
            staging_dir: _,
            temp_staging,
        } = self;

        let watched = supervisor.run().await;
        // Dropping the supervisor drops the handlers and with them the queue
        // producer, which lets the writer drain and exit.
        drop(supervisor);

        let stats = writer.await.context("batch writer failed to join")?;
        drop(temp_staging);

        watched?;
        Ok(stats)
    }
}

/// Execute one CLI command.
pub async fn execute(command: Command, config: PipelineConfig) -> Result<()> {
    match command {
        Command::InitDb => {
            let database = Database::new(config.database_path.clone())?;
            info!("Database ready at {}", database.path().display());
            println!("Done");
        }
        Command::HashImage { image, rename } => {
            let hash = tokio::task::spawn_blocking(move || -> Result<String> {
                if rename {
                    let renamed = hash_and_rename(&image)?;
                    info!("Renamed {} -> {}", image.display(), renamed.display());
                    Ok(image_id_for(&renamed))
                } else {
                    Ok(compute_image_hash(&image)?)
                }
            })
            .await
            .context("hash worker join failed")??;
            println!("{hash}");
        }
        Command::Analyze(args) => {
            let Some(source) = args.source() else {
                bail!("either an image or --s3 KEY BUCKET is required");
            };
            let analyzer = HttpExpenseAnalyzer::new(config.analysis_endpoint.clone())?;
            let summary = match source {
                AnalyzeSource::Local(path) => analyze_local(&analyzer, &path).await?,
                AnalyzeSource::Object { key, bucket } => {
                    analyze_object(&analyzer, &key, &bucket).await?
                }
            };
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Watch(_) => {
            if config.analysis_endpoint.is_none() {
                warn!("No analysis endpoint configured; staged receipts will fail analysis");
            }
            let analyzer = Arc::new(HttpExpenseAnalyzer::new(config.analysis_endpoint.clone())?);
            let database = Arc::new(Database::new(config.database_path.clone())?);

            let pipeline = ReceiptPipeline::build(&config, analyzer, database)?;
            info!("Staging hashed receipts in {}", pipeline.staging_dir().display());

            let stats = pipeline.run().await?;
            info!(
                "Stored {} receipts in {} batches",
                stats.receipts_written, stats.batches_written
            );
        }
        Command::Upload(args) => {
            let Some(bucket_root) = config.bucket_root.clone() else {
                bail!("no bucket root configured (--bucket-root or RECEIPTWATCH_BUCKET_ROOT)");
            };
            let handler =
                MoveToBucketHandler::new(DirectoryBucket::new(bucket_root), config.bucket.clone());

            let mut supervisor = WatchSupervisor::new(config.pause_for());
            supervisor.watch(WatchedDirectory::new(args.dir, Arc::new(handler)))?;
            supervisor.run().await?;
        }
        Command::Receipts { limit } => {
            let database = Database::new(config.database_path.clone())?;
            let receipts = database.get_receipts(limit).await?;
            println!("{}", serde_json::to_string_pretty(&receipts)?);
        }
    }
    Ok(())
}
