use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::{EventHandler, FileEvent, WatchedDirectory};

pub const DEFAULT_PAUSE: Duration = Duration::from_secs(5);

/// Events buffered per directory before the observer thread waits for the handler.
const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SupervisorState {
    Created,
    Running,
    Stopped,
}

/// Owns the directory watches and the tasks that feed their handlers.
///
/// Each directory gets its own dispatcher task, so one directory's events are
/// handled one at a time while different directories run concurrently.
pub struct WatchSupervisor {
    directories: Vec<WatchedDirectory>,
    pause_for: Duration,
    state: SupervisorState,
    cancel_token: CancellationToken,
    watchers: Vec<RecommendedWatcher>,
    dispatchers: Vec<JoinHandle<()>>,
}

impl WatchSupervisor {
    pub fn new(pause_for: Duration) -> Self {
        Self {
            directories: Vec::new(),
            pause_for,
            state: SupervisorState::Created,
            cancel_token: CancellationToken::new(),
            watchers: Vec::new(),
            dispatchers: Vec::new(),
        }
    }

    pub fn watch(&mut self, directory: WatchedDirectory) -> Result<()> {
        if self.state != SupervisorState::Created {
            bail!("cannot add {} after the supervisor started", directory.path.display());
        }
        self.directories.push(directory);
        Ok(())
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn pause_for(&self) -> Duration {
        self.pause_for
    }

    /// Token cancelled when the supervisor stops. Cancelling it from outside
    /// ends [`WatchSupervisor::run`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn start(&mut self) -> Result<()> {
        if self.state != SupervisorState::Created {
            bail!("supervisor already started");
        }
        // Running before registration, so `stop` tears down a partial start.
        self.state = SupervisorState::Running;

        for directory in self.directories.clone() {
            let (tx, rx) = mpsc::channel::<FileEvent>(EVENT_BUFFER);
            let label = directory.path.display().to_string();

            let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                match res {
                    Ok(event) => {
                        for file_event in FileEvent::from_notify(&event) {
                            if tx.blocking_send(file_event).is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => warn!("watch error on {label}: {err}"),
                }
            })
            .context("failed to create file watcher")?;

            watcher
                .watch(&directory.path, RecursiveMode::NonRecursive)
                .with_context(|| format!("failed to watch {}", directory.path.display()))?;

            self.watchers.push(watcher);
            self.dispatchers.push(tokio::spawn(dispatch(
                directory.handler.clone(),
                rx,
                self.cancel_token.clone(),
            )));
            info!(
                "Watching {} with {}",
                directory.path.display(),
                directory.handler.name()
            );
        }

        Ok(())
    }

    /// Start watching (unless already started) and keep the process alive until Ctrl-C or until the
    /// shutdown token is cancelled. The watches are stopped on every path out.
    pub async fn run(&mut self) -> Result<()> {
        self.run_until(tokio::signal::ctrl_c()).await
    }

    /// [`WatchSupervisor::run`] with `interrupt` in place of Ctrl-C.
    pub async fn run_until<F>(&mut self, interrupt: F) -> Result<()>
    where
        F: Future<Output = io::Result<()>>,
    {
        let started = match self.state {
            SupervisorState::Created => self.start(),
            SupervisorState::Running | SupervisorState::Stopped => Ok(()),
        };
        let result = match started {
            Ok(()) => self.keep_alive(interrupt).await,
            Err(err) => Err(err),
        };
        let stopped = self.stop().await;
        result.and(stopped)
    }

    async fn keep_alive<F>(&self, interrupt: F) -> Result<()>
    where
        F: Future<Output = io::Result<()>>,
    {
        // Registered once so a signal between two wake-ups is not lost.
        tokio::pin!(interrupt);
        loop {
            tokio::select! {
                _ = sleep(self.pause_for) => debug!("supervisor alive, {} watches", self.watchers.len()),
                signal = &mut interrupt => {
                    signal.context("failed to listen for Ctrl-C")?;
                    info!("Interrupt received, stopping watches");
                    return Ok(());
                }
                _ = self.cancel_token.cancelled() => return Ok(()),
            }
        }
    }

    /// Stop observing and wait for every dispatcher to finish. No handler is
    /// invoked after this returns; an event already being handled completes
    /// first.
    pub async fn stop(&mut self) -> Result<()> {
        if self.state == SupervisorState::Stopped {
            return Ok(());
        }

        self.cancel_token.cancel();
        self.watchers.clear();

        let mut failed = 0;
        for handle in self.dispatchers.drain(..) {
            if let Err(err) = handle.await {
                error!("event dispatcher failed to join: {err}");
                failed += 1;
            }
        }

        self.state = SupervisorState::Stopped;
        info!("Stopped all watches");

        if failed > 0 {
            bail!("{failed} event dispatchers failed");
        }
        Ok(())
    }
}

impl Drop for WatchSupervisor {
    fn drop(&mut self) {
        if self.state == SupervisorState::Running {
            self.cancel_token.cancel();
            self.watchers.clear();
        }
    }
}

async fn dispatch(
    handler: Arc<dyn EventHandler>,
    mut events: mpsc::Receiver<FileEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        debug!("({}) {:?} {}", handler.name(), event.kind, event.path.display());
        if let Err(err) = handler.on_created(&event, &shutdown).await {
            error!(
                "({}) failed to handle {}: {err:#}",
                handler.name(),
                event.path.display()
            );
        }
    }
    debug!("({}) dispatcher stopped", handler.name());
}
