use std::io;
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::watcher::{EventHandler, FileEvent};

#[derive(Debug, Error)]
pub enum MoveError {
    #[error("destination {0} already exists")]
    AlreadyExists(PathBuf),
    #[error("{0} has no file name")]
    NoFileName(PathBuf),
    #[error("failed to move file: {0}")]
    Io(#[from] io::Error),
}

/// Move `src` into `dest_dir`, keeping its file name.
///
/// Refuses to overwrite. Falls back to [`copy_into_place`] when a plain rename
/// is not possible (e.g. across filesystems).
pub async fn move_into(src: &Path, dest_dir: &Path) -> Result<PathBuf, MoveError> {
    let file_name = src
        .file_name()
        .ok_or_else(|| MoveError::NoFileName(src.to_path_buf()))?;
    let dest = dest_dir.join(file_name);

    if tokio::fs::try_exists(&dest).await? {
        return Err(MoveError::AlreadyExists(dest));
    }

    match tokio::fs::rename(src, &dest).await {
        Ok(()) => Ok(dest),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Err(err.into()),
        Err(err) => {
            debug!("rename of {} failed ({err}), copying instead", src.display());
            copy_into_place(src, &dest).await?;
            Ok(dest)
        }
    }
}

/// Copy `src` to `dest` and remove `src`.
///
/// The bytes land under a hidden `.<name>.partial` sibling first and are then
/// renamed, so `dest` only ever appears complete.
pub async fn copy_into_place(src: &Path, dest: &Path) -> Result<(), MoveError> {
    let partial = partial_path(dest)?;
    if let Err(err) = tokio::fs::copy(src, &partial).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(err.into());
    }
    tokio::fs::rename(&partial, dest).await?;
    tokio::fs::remove_file(src).await?;
    Ok(())
}

fn partial_path(dest: &Path) -> Result<PathBuf, MoveError> {
    let name = dest
        .file_name()
        .ok_or_else(|| MoveError::NoFileName(dest.to_path_buf()))?;
    Ok(dest.with_file_name(format!(".{}.partial", name.to_string_lossy())))
}

/// Object storage the pipeline can hand files to.
#[async_trait]
pub trait ObjectMover: Send + Sync {
    /// Move the local file into `bucket`; returns the object location.
    async fn move_to(&self, local_path: &Path, bucket: &str) -> Result<String>;
}

/// Buckets as directories under a local root: `<root>/<bucket>/<file>`.
#[derive(Debug, Clone)]
pub struct DirectoryBucket {
    root: PathBuf,
}

impl DirectoryBucket {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ObjectMover for DirectoryBucket {
    async fn move_to(&self, local_path: &Path, bucket: &str) -> Result<String> {
        let bucket_dir = self.root.join(bucket);
        tokio::fs::create_dir_all(&bucket_dir).await?;
        let dest = move_into(local_path, &bucket_dir).await?;
        Ok(dest.display().to_string())
    }
}

/// Moves every new file of a directory into a bucket. Failures are logged.
pub struct MoveToBucketHandler<M: ObjectMover> {
    mover: M,
    bucket: String,
}

impl<M: ObjectMover> MoveToBucketHandler<M> {
    pub fn new(mover: M, bucket: impl Into<String>) -> Self {
        Self {
            mover,
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl<M: ObjectMover> EventHandler for MoveToBucketHandler<M> {
    fn name(&self) -> &str {
        "move-to-bucket"
    }

    async fn on_created(&self, event: &FileEvent, _shutdown: &CancellationToken) -> Result<()> {
        if event.is_dir || event.is_hidden() {
            return Ok(());
        }

        match self.mover.move_to(&event.path, &self.bucket).await {
            Ok(location) => info!("Moved {} -> {location}", event.path.display()),
            Err(err) => warn!(
                "failed to move {} to bucket {}: {err:#}",
                event.path.display(),
                self.bucket
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn move_into_keeps_name_and_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("staging");
        std::fs::create_dir(&staging).unwrap();

        let src = dir.path().join("abc.png");
        std::fs::write(&src, b"one").unwrap();
        let dest = move_into(&src, &staging).await.unwrap();
        assert_eq!(dest, staging.join("abc.png"));
        assert!(!src.exists());

        std::fs::write(&src, b"two").unwrap();
        let err = move_into(&src, &staging).await.unwrap_err();
        assert!(matches!(err, MoveError::AlreadyExists(_)));
        assert!(src.exists());
        assert_eq!(std::fs::read(staging.join("abc.png")).unwrap(), b"one");
    }

    #[tokio::test]
    async fn copy_fallback_only_exposes_the_finished_file() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("staging");
        std::fs::create_dir(&staging).unwrap();
        let src = dir.path().join("0f0f0f0f0f0f0f0f.png");
        std::fs::write(&src, vec![7u8; 4096]).unwrap();

        let dest = staging.join("0f0f0f0f0f0f0f0f.png");
        let partial = partial_path(&dest).unwrap();
        assert_eq!(partial, staging.join(".0f0f0f0f0f0f0f0f.png.partial"));
        assert!(FileEvent::created(&partial).is_hidden());

        copy_into_place(&src, &dest).await.unwrap();

        assert!(!src.exists());
        assert!(!partial.exists());
        assert_eq!(std::fs::read(&dest).unwrap().len(), 4096);
        let names: Vec<_> = std::fs::read_dir(&staging)
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("0f0f0f0f0f0f0f0f.png")]);
    }

    #[tokio::test]
    async fn copy_fallback_cleans_up_after_a_failed_copy() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("abc.png");

        let err = copy_into_place(&dir.path().join("missing.png"), &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, MoveError::Io(_)));
        assert!(!dest.exists());
        assert!(!partial_path(&dest).unwrap().exists());
    }

    #[tokio::test]
    async fn bucket_handler_moves_new_files() {
        let dir = tempfile::tempdir().unwrap();
        let outbox = dir.path().join("outbox");
        std::fs::create_dir(&outbox).unwrap();
        let file = outbox.join("feed.png");
        std::fs::write(&file, b"img").unwrap();

        let handler = MoveToBucketHandler::new(
            DirectoryBucket::new(dir.path().join("buckets")),
            "receipt-image",
        );
        handler
            .on_created(&FileEvent::created(&file), &CancellationToken::new())
            .await
            .unwrap();

        assert!(!file.exists());
        assert!(dir
            .path()
            .join("buckets/receipt-image/feed.png")
            .exists());
    }

    #[tokio::test]
    async fn bucket_handler_survives_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let handler = MoveToBucketHandler::new(DirectoryBucket::new(dir.path()), "b");
        let result = handler
            .on_created(
                &FileEvent::created(dir.path().join("missing.png")),
                &CancellationToken::new(),
            )
            .await;
        assert!(result.is_ok());
    }
}
