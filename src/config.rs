//! Runtime configuration.
//!
//! Values are layered: built-in defaults, then an optional JSON file, then
//! `RECEIPTWATCH_*` environment variables, then command-line flags.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::queue::DEFAULT_QUEUE_CAPACITY;
use crate::watcher::DEFAULT_PAUSE;

pub const ENV_PREFIX: &str = "RECEIPTWATCH_";
pub const DEFAULT_DATABASE: &str = "analyzed_receipts.sqlite3";
pub const DEFAULT_BUCKET: &str = "receipt-image";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct PipelineConfig {
    pub watch_dir: Option<PathBuf>,
    pub staging_dir: Option<PathBuf>,
    pub database_path: PathBuf,
    pub queue_capacity: usize,
    pub pause_for_secs: u64,
    pub stable_poll_ms: u64,
    pub writer_poll_ms: u64,
    pub analysis_timeout_secs: u64,
    pub analysis_endpoint: Option<String>,
    pub bucket_root: Option<PathBuf>,
    pub bucket: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            watch_dir: None,
            staging_dir: None,
            database_path: PathBuf::from(DEFAULT_DATABASE),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            pause_for_secs: DEFAULT_PAUSE.as_secs(),
            stable_poll_ms: 1000,
            writer_poll_ms: 500,
            analysis_timeout_secs: 60,
            analysis_endpoint: None,
            bucket_root: None,
            bucket: DEFAULT_BUCKET.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("queue capacity must be at least 1")]
    ZeroQueueCapacity,
    #[error("pause interval must be at least 1 second")]
    ZeroPause,
    #[error("no watch directory configured")]
    MissingWatchDir,
    #[error("{0} does not exist or is not a directory")]
    NotADirectory(PathBuf),
    #[error("staging directory can not be the same as the watch directory")]
    StagingIsWatchDir,
    #[error("invalid value {value:?} for {key}")]
    InvalidEnv { key: String, value: String },
}

impl PipelineConfig {
    /// Defaults overlaid with `path` when given, then with the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Overlay `RECEIPTWATCH_*` variables looked up through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(value) = var("WATCH_DIR") {
            self.watch_dir = Some(value.into());
        }
        if let Some(value) = var("STAGING_DIR") {
            self.staging_dir = Some(value.into());
        }
        if let Some(value) = var("DATABASE") {
            self.database_path = value.into();
        }
        if let Some(value) = var("ANALYSIS_ENDPOINT") {
            self.analysis_endpoint = Some(value);
        }
        if let Some(value) = var("BUCKET_ROOT") {
            self.bucket_root = Some(value.into());
        }
        if let Some(value) = var("BUCKET") {
            self.bucket = value;
        }

        parse_env(&var, "QUEUE_SIZE", &mut self.queue_capacity)?;
        parse_env(&var, "PAUSE", &mut self.pause_for_secs)?;
        parse_env(&var, "STABLE_POLL_MS", &mut self.stable_poll_ms)?;
        parse_env(&var, "WRITER_POLL_MS", &mut self.writer_poll_ms)?;
        parse_env(&var, "ANALYSIS_TIMEOUT", &mut self.analysis_timeout_secs)?;
        Ok(())
    }

    pub fn pause_for(&self) -> Duration {
        Duration::from_secs(self.pause_for_secs)
    }

    pub fn stable_poll(&self) -> Duration {
        Duration::from_millis(self.stable_poll_ms)
    }

    pub fn writer_poll(&self) -> Duration {
        Duration::from_millis(self.writer_poll_ms)
    }

    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_secs(self.analysis_timeout_secs)
    }

    /// Checks needed before watching. A missing staging dir is allowed; the
    /// caller stages into a temporary directory instead.
    pub fn validate_for_watch(&self) -> Result<&Path, ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        if self.pause_for_secs == 0 {
            return Err(ConfigError::ZeroPause);
        }

        let watch_dir = self
            .watch_dir
            .as_deref()
            .ok_or(ConfigError::MissingWatchDir)?;
        ensure_dir(watch_dir)?;

        if let Some(staging_dir) = self.staging_dir.as_deref() {
            ensure_dir(staging_dir)?;
            if same_dir(watch_dir, staging_dir) {
                return Err(ConfigError::StagingIsWatchDir);
            }
        }
        Ok(watch_dir)
    }
}

fn parse_env<T, F>(var: &F, name: &str, target: &mut T) -> Result<(), ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = var(name) {
        *target = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
            key: format!("{ENV_PREFIX}{name}"),
            value,
        })?;
    }
    Ok(())
}

fn ensure_dir(path: &Path) -> Result<(), ConfigError> {
    if path.is_dir() {
        Ok(())
    } else {
        Err(ConfigError::NotADirectory(path.to_path_buf()))
    }
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = PipelineConfig::default();
        assert_eq!(config.queue_capacity, 10);
        assert_eq!(config.pause_for(), Duration::from_secs(5));
        assert_eq!(config.stable_poll(), Duration::from_secs(1));
        assert_eq!(config.database_path, PathBuf::from(DEFAULT_DATABASE));
        assert_eq!(config.bucket, "receipt-image");
    }

    #[test]
    fn file_then_env_layering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("receiptwatch.json");
        fs::write(&path, r#"{"queueCapacity": 4, "pauseForSecs": 2, "bucket": "from-file"}"#).unwrap();

        let mut config = PipelineConfig::from_file(&path).unwrap();
        assert_eq!(config.queue_capacity, 4);
        assert_eq!(config.writer_poll_ms, 500);

        config
            .apply_env(env(&[
                ("RECEIPTWATCH_QUEUE_SIZE", "7"),
                ("RECEIPTWATCH_BUCKET", "from-env"),
            ]))
            .unwrap();
        assert_eq!(config.queue_capacity, 7);
        assert_eq!(config.pause_for_secs, 2);
        assert_eq!(config.bucket, "from-env");
    }

    #[test]
    fn bad_env_number_is_reported() {
        let mut config = PipelineConfig::default();
        let err = config
            .apply_env(env(&[("RECEIPTWATCH_PAUSE", "soon")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidEnv {
                key: "RECEIPTWATCH_PAUSE".into(),
                value: "soon".into()
            }
        );
    }

    #[test]
    fn watch_validation() {
        let dir = tempfile::tempdir().unwrap();
        let watch = dir.path().join("watch");
        fs::create_dir(&watch).unwrap();

        let mut config = PipelineConfig::default();
        assert_eq!(config.validate_for_watch(), Err(ConfigError::MissingWatchDir));

        config.watch_dir = Some(watch.clone());
        assert_eq!(config.validate_for_watch(), Ok(watch.as_path()));

        config.staging_dir = Some(watch.clone());
        assert_eq!(config.validate_for_watch(), Err(ConfigError::StagingIsWatchDir));

        config.staging_dir = Some(dir.path().join("missing"));
        assert!(matches!(
            config.validate_for_watch(),
            Err(ConfigError::NotADirectory(_))
        ));

        config.staging_dir = None;
        config.queue_capacity = 0;
        assert_eq!(config.validate_for_watch(), Err(ConfigError::ZeroQueueCapacity));
    }
}
