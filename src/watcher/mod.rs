//! Directory watches and the handlers bound to them.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Event, EventKind};
use tokio_util::sync::CancellationToken;

mod supervisor;

pub use supervisor::{SupervisorState, WatchSupervisor, DEFAULT_PAUSE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    Created,
    /// Renamed or moved into the watched directory from elsewhere.
    MovedIn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: FileEventKind,
    pub is_dir: bool,
}

impl FileEvent {
    pub fn created(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: FileEventKind::Created,
            is_dir: false,
        }
    }

    pub fn moved_in(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: FileEventKind::MovedIn,
            ..Self::created(path)
        }
    }

    /// Dot-files, including in-progress `.partial` copies.
    pub fn is_hidden(&self) -> bool {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().starts_with('.'))
            .unwrap_or(false)
    }

    /// Arrivals of new entries; everything else the observer reports is ignored.
    pub fn from_notify(event: &Event) -> Vec<FileEvent> {
        let (kind, folder_hint) = match event.kind {
            EventKind::Create(CreateKind::Folder) => (FileEventKind::Created, Some(true)),
            EventKind::Create(CreateKind::File) => (FileEventKind::Created, Some(false)),
            EventKind::Create(_) => (FileEventKind::Created, None),
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => (FileEventKind::MovedIn, None),
            _ => return Vec::new(),
        };

        event
            .paths
            .iter()
            .map(|path| FileEvent {
                path: path.clone(),
                kind,
                is_dir: folder_hint.unwrap_or_else(|| path.is_dir()),
            })
            .collect()
    }
}

/// Reacts to new entries in one watched directory.
///
/// Calls for one directory never overlap; the supervisor delivers that
/// directory's events one at a time, in notification order.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn on_created(&self, event: &FileEvent, shutdown: &CancellationToken) -> anyhow::Result<()>;
}

/// A directory bound to the handler that processes its events.
#[derive(Clone)]
pub struct WatchedDirectory {
    pub path: PathBuf,
    pub handler: Arc<dyn EventHandler>,
}

impl WatchedDirectory {
    pub fn new(path: impl Into<PathBuf>, handler: Arc<dyn EventHandler>) -> Self {
        Self {
            path: path.into(),
            handler,
        }
    }
}

impl std::fmt::Debug for WatchedDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchedDirectory")
            .field("path", &self.path)
            .field("handler", &self.handler.name())
            .finish()
    }
}
