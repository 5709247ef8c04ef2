use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::mover::move_into;
use super::phash::{hash_and_rename, is_supported_image};
use super::stable_file::{StableFileWaiter, WaitOutcome};
use crate::watcher::{EventHandler, FileEvent, FileEventKind};

/// Where a single image is in its trip from the watch directory to staging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestState {
    Idle,
    Waiting,
    Hashing,
    Staged { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Not an image this pipeline handles.
    Ignored,
    /// The rename event of a file this handler already hashed.
    OwnRename,
    /// The file disappeared before it became stable.
    Vanished,
    /// Shutdown arrived while waiting; the file was left untouched.
    Cancelled,
    /// Renamed to its hash. `moved` is false when the move into staging failed
    /// and the file stayed renamed next to the original.
    Staged { path: PathBuf, moved: bool },
}

/// Waits for new scans, renames them to `<hash>.<ext>` and moves them into staging.
pub struct ImageIngestHandler {
    waiter: StableFileWaiter,
    target_dir: Option<PathBuf>,
    // Hashed names whose rename event has not been seen yet.
    own_renames: Mutex<HashSet<PathBuf>>,
}

impl ImageIngestHandler {
    pub fn new(waiter: StableFileWaiter, target_dir: Option<PathBuf>) -> Self {
        Self {
            waiter,
            target_dir,
            own_renames: Mutex::new(HashSet::new()),
        }
    }

    pub fn target_dir(&self) -> Option<&Path> {
        self.target_dir.as_deref()
    }

    /// Like [`ImageIngestHandler::ingest`], but skips the rename events this
    /// handler causes itself.
    pub async fn handle(&self, event: &FileEvent, shutdown: &CancellationToken) -> Result<IngestOutcome> {
        if event.kind == FileEventKind::MovedIn && self.own_renames.lock().await.remove(&event.path) {
            debug!("skipping own rename {}", event.path.display());
            return Ok(IngestOutcome::OwnRename);
        }
        self.ingest(&event.path, shutdown).await
    }

    pub async fn ingest(&self, src_path: &Path, shutdown: &CancellationToken) -> Result<IngestOutcome> {
        if !is_supported_image(src_path) {
            debug!("ignoring non-image file {}", src_path.display());
            return Ok(IngestOutcome::Ignored);
        }

        let mut state = IngestState::Idle;
        loop {
            state = match state {
                IngestState::Idle => IngestState::Waiting,
                IngestState::Waiting => match self.waiter.wait(src_path, shutdown).await {
                    WaitOutcome::Stable { size } => {
                        debug!("{} is stable at {size} bytes", src_path.display());
                        IngestState::Hashing
                    }
                    WaitOutcome::Vanished => {
                        debug!("{} vanished before it was stable", src_path.display());
                        return Ok(IngestOutcome::Vanished);
                    }
                    WaitOutcome::Cancelled => return Ok(IngestOutcome::Cancelled),
                },
                IngestState::Hashing => {
                    let path = src_path.to_path_buf();
                    let renamed = tokio::task::spawn_blocking(move || hash_and_rename(&path))
                        .await
                        .context("hash worker join failed")?
                        .with_context(|| format!("failed to hash {}", src_path.display()))?;

                    info!("Hashed {} -> {}", file_name(src_path), file_name(&renamed));
                    if renamed != src_path {
                        self.own_renames.lock().await.insert(renamed.clone());
                    }
                    IngestState::Staged { path: renamed }
                }
                IngestState::Staged { path } => return Ok(self.stage(path).await),
            };
        }
    }

    async fn stage(&self, renamed: PathBuf) -> IngestOutcome {
        let Some(target_dir) = self.target_dir.as_deref() else {
            return IngestOutcome::Staged {
                path: renamed,
                moved: false,
            };
        };

        match move_into(&renamed, target_dir).await {
            Ok(path) => IngestOutcome::Staged { path, moved: true },
            Err(err) => {
                warn!("{err}");
                IngestOutcome::Staged {
                    path: renamed,
                    moved: false,
                }
            }
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[async_trait]
impl EventHandler for ImageIngestHandler {
    fn name(&self) -> &str {
        "image-ingest"
    }

    async fn on_created(&self, event: &FileEvent, shutdown: &CancellationToken) -> Result<()> {
        if event.is_dir || event.is_hidden() {
            return Ok(());
        }
        self.handle(event, shutdown).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::phash::compute_image_hash;
    use image::{ImageBuffer, Luma};
    use std::time::Duration;

    fn write_scan(path: &Path, seed: u8) {
        let img = ImageBuffer::from_fn(16, 16, |x, y| {
            Luma([((x * 16 + y) as u8).wrapping_mul(seed)])
        });
        img.save(path).unwrap();
    }

    fn handler(target: Option<PathBuf>) -> ImageIngestHandler {
        ImageIngestHandler::new(StableFileWaiter::new(Duration::from_millis(10)), target)
    }

    #[tokio::test]
    async fn stages_hashed_image() {
        let dir = tempfile::tempdir().unwrap();
        let watch = dir.path().join("watch");
        let staging = dir.path().join("staging");
        std::fs::create_dir_all(&watch).unwrap();
        std::fs::create_dir_all(&staging).unwrap();

        let scan = watch.join("Scan_1.png");
        write_scan(&scan, 3);
        let hash = compute_image_hash(&scan).unwrap();

        let outcome = handler(Some(staging.clone()))
            .ingest(&scan, &CancellationToken::new())
            .await
            .unwrap();

        let expected = staging.join(format!("{hash}.png"));
        assert_eq!(
            outcome,
            IngestOutcome::Staged {
                path: expected.clone(),
                moved: true
            }
        );
        assert!(expected.exists());
        assert!(!scan.exists());
    }

    #[tokio::test]
    async fn duplicate_stays_renamed_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let watch = dir.path().join("watch");
        let staging = dir.path().join("staging");
        std::fs::create_dir_all(&watch).unwrap();
        std::fs::create_dir_all(&staging).unwrap();

        let scan = watch.join("Scan_2.png");
        write_scan(&scan, 5);
        let hash = compute_image_hash(&scan).unwrap();
        std::fs::write(staging.join(format!("{hash}.png")), b"already here").unwrap();

        let outcome = handler(Some(staging))
            .ingest(&scan, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            IngestOutcome::Staged {
                path: watch.join(format!("{hash}.png")),
                moved: false
            }
        );
    }

    #[tokio::test]
    async fn own_rename_event_is_not_ingested_again() {
        let dir = tempfile::tempdir().unwrap();
        let watch = dir.path().join("watch");
        let staging = dir.path().join("staging");
        std::fs::create_dir_all(&watch).unwrap();
        std::fs::create_dir_all(&staging).unwrap();

        let scan = watch.join("Scan_3.png");
        write_scan(&scan, 7);
        let hash = compute_image_hash(&scan).unwrap();
        std::fs::write(staging.join(format!("{hash}.png")), b"already here").unwrap();

        let handler = handler(Some(staging));
        let cancel = CancellationToken::new();
        handler.handle(&FileEvent::created(&scan), &cancel).await.unwrap();

        // The duplicate stays in the watch dir under its hashed name.
        let renamed = watch.join(format!("{hash}.png"));
        assert!(renamed.exists());
        let moved_in = FileEvent::moved_in(&renamed);
        assert_eq!(
            handler.handle(&moved_in, &cancel).await.unwrap(),
            IngestOutcome::OwnRename
        );
        assert!(renamed.exists());

        // Only the one event is swallowed.
        assert!(handler.own_renames.lock().await.is_empty());
    }

    #[tokio::test]
    async fn moved_in_scans_from_elsewhere_are_ingested() {
        let dir = tempfile::tempdir().unwrap();
        let scan = dir.path().join("Scan_4.png");
        write_scan(&scan, 9);

        let outcome = handler(None)
            .handle(&FileEvent::moved_in(&scan), &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Staged { moved: false, .. }));
    }

    #[tokio::test]
    async fn non_images_and_missing_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let notes = dir.path().join("notes.txt");
        std::fs::write(&notes, b"hi").unwrap();

        let handler = handler(None);
        let cancel = CancellationToken::new();
        assert_eq!(handler.ingest(&notes, &cancel).await.unwrap(), IngestOutcome::Ignored);
        assert_eq!(
            handler
                .ingest(&dir.path().join("gone.png"), &cancel)
                .await
                .unwrap(),
            IngestOutcome::Vanished
        );
    }

    #[tokio::test]
    async fn corrupt_image_is_an_error_not_a_panic() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("Scan_9.png");
        std::fs::write(&bogus, b"definitely not a png").unwrap();

        let result = handler(None).ingest(&bogus, &CancellationToken::new()).await;
        assert!(result.is_err());
        assert!(bogus.exists());
    }
}
