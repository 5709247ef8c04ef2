pub mod analysis;
pub mod app;
pub mod cli;
pub mod config;
pub mod db;
pub mod ingest;
pub mod pipeline;
pub mod watcher;

use anyhow::{Context, Result};
use clap::Parser;

use cli::Cli;
use config::PipelineConfig;

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging (RUST_LOG still wins over the default level)
    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    log::info!("receiptwatch starting up...");

    let mut config = PipelineConfig::load(cli.config.as_deref())?;
    cli.apply_overrides(&mut config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("receiptwatch")
        .build()
        .context("failed to start tokio runtime")?;

    runtime.block_on(app::execute(cli.command, config))
}
