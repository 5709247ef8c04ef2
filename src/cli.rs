use std::path::PathBuf;

use clap::{ArgGroup, Args, Parser, Subcommand};

use crate::config::PipelineConfig;

/// Watch a scanner folder and turn receipt images into database records.
#[derive(Debug, Parser)]
#[command(name = "receiptwatch", version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// JSON config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// SQLite database file
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create the receipt tables and exit
    InitDb,

    /// Print the content hash of an image
    HashImage {
        image: PathBuf,

        /// Rename the image to <hash><ext>
        #[arg(short, long)]
        rename: bool,
    },

    /// Analyze one receipt and print its summary and line items
    Analyze(AnalyzeArgs),

    /// Watch a directory for new scans and store the analyzed receipts
    Watch(WatchArgs),

    /// Move every new file of a directory into a bucket
    Upload(UploadArgs),

    /// List stored receipts, newest first
    Receipts {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("source").required(true).args(["image", "s3"])))]
pub struct AnalyzeArgs {
    /// Local receipt image
    pub image: Option<PathBuf>,

    /// Object already in a bucket
    #[arg(long, num_args = 2, value_names = ["KEY", "BUCKET"])]
    pub s3: Option<Vec<String>>,

    /// Analysis service URL
    #[arg(long)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalyzeSource {
    Local(PathBuf),
    Object { key: String, bucket: String },
}

impl AnalyzeArgs {
    pub fn source(&self) -> Option<AnalyzeSource> {
        if let Some(image) = &self.image {
            return Some(AnalyzeSource::Local(image.clone()));
        }
        match self.s3.as_deref() {
            Some([key, bucket]) => Some(AnalyzeSource::Object {
                key: key.clone(),
                bucket: bucket.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Directory the scanner writes into
    pub watch_dir: PathBuf,

    /// Where hashed images are staged for analysis (temporary dir when omitted)
    #[arg(long)]
    pub staging_dir: Option<PathBuf>,

    /// Capacity of the receipt queue
    #[arg(short = 's', long)]
    pub queue_size: Option<usize>,

    /// Seconds between supervisor wake-ups
    #[arg(short, long)]
    pub pause: Option<u64>,

    /// Analysis service URL
    #[arg(long)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Args)]
pub struct UploadArgs {
    /// Directory whose new files are moved
    pub dir: PathBuf,

    #[arg(long)]
    pub bucket: Option<String>,

    /// Local directory holding the buckets
    #[arg(long)]
    pub bucket_root: Option<PathBuf>,
}

impl Cli {
    /// Flags win over file and environment values.
    pub fn apply_overrides(&self, config: &mut PipelineConfig) {
        if let Some(database) = &self.database {
            config.database_path = database.clone();
        }

        match &self.command {
            Command::Analyze(args) => {
                if let Some(endpoint) = &args.endpoint {
                    config.analysis_endpoint = Some(endpoint.clone());
                }
            }
            Command::Watch(args) => {
                config.watch_dir = Some(args.watch_dir.clone());
                if let Some(staging_dir) = &args.staging_dir {
                    config.staging_dir = Some(staging_dir.clone());
                }
                if let Some(queue_size) = args.queue_size {
                    config.queue_capacity = queue_size;
                }
                if let Some(pause) = args.pause {
                    config.pause_for_secs = pause;
                }
                if let Some(endpoint) = &args.endpoint {
                    config.analysis_endpoint = Some(endpoint.clone());
                }
            }
            Command::Upload(args) => {
                if let Some(bucket) = &args.bucket {
                    config.bucket = bucket.clone();
                }
                if let Some(bucket_root) = &args.bucket_root {
                    config.bucket_root = Some(bucket_root.clone());
                }
            }
            Command::InitDb | Command::HashImage { .. } | Command::Receipts { .. } => {}
        }
    }
}
