//! Waits for a freshly created file to be completely written.
//!
//! A scanner driver usually creates the file first and streams pixels into it
//! afterwards, so a create event alone says nothing about readiness. The file
//! is considered ready once it can be opened and its size is identical on two
//! consecutive polls.

use std::io;
use std::path::Path;
use std::time::Duration;

use log::{debug, warn};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    Opening,
    Measuring { last_size: Option<u64> },
    Stable { size: u64 },
    Vanished,
}

/// What a single probe of the file saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Opened,
    OpenFailed(io::ErrorKind),
    Size(u64),
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Stable { size: u64 },
    Vanished,
    Cancelled,
}

impl WaitState {
    pub fn advance(self, observation: Observation) -> WaitState {
        match (self, observation) {
            (WaitState::Stable { .. } | WaitState::Vanished, _) => self,
            (_, Observation::Missing) => WaitState::Vanished,
            (_, Observation::OpenFailed(io::ErrorKind::NotFound)) => WaitState::Vanished,
            (WaitState::Opening, Observation::Opened) => WaitState::Measuring { last_size: None },
            (WaitState::Opening, _) => WaitState::Opening,
            (WaitState::Measuring { last_size: Some(last) }, Observation::Size(size))
                if last == size =>
            {
                WaitState::Stable { size }
            }
            (WaitState::Measuring { .. }, Observation::Size(size)) => WaitState::Measuring {
                last_size: Some(size),
            },
            // A measured file that can no longer be opened starts over.
            (WaitState::Measuring { .. }, Observation::OpenFailed(_)) => WaitState::Opening,
            (WaitState::Measuring { .. }, Observation::Opened) => self,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WaitState::Stable { .. } | WaitState::Vanished)
    }

    /// Whether the waiter sleeps one poll interval before the next probe.
    fn pauses_before_next_probe(&self) -> bool {
        match self {
            WaitState::Opening => true,
            WaitState::Measuring { last_size } => last_size.is_some(),
            WaitState::Stable { .. } | WaitState::Vanished => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StableFileWaiter {
    poll_interval: Duration,
}

impl Default for StableFileWaiter {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl StableFileWaiter {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Returns once the file is stable, has disappeared, or `cancel` fires.
    /// Transient open failures are logged and retried without limit.
    pub async fn wait(&self, path: &Path, cancel: &CancellationToken) -> WaitOutcome {
        let mut state = WaitState::Opening;
        let mut open_failures: u64 = 0;

        loop {
            let observation = match state {
                WaitState::Opening => probe_open(path).await,
                WaitState::Measuring { .. } => probe_size(path).await,
                WaitState::Stable { size } => return WaitOutcome::Stable { size },
                WaitState::Vanished => return WaitOutcome::Vanished,
            };

            if let Observation::OpenFailed(kind) = observation {
                open_failures += 1;
                if open_failures == 1 {
                    warn!("{} is not readable yet ({kind:?}), retrying", path.display());
                } else {
                    debug!(
                        "{} still not readable after {open_failures} attempts ({kind:?})",
                        path.display()
                    );
                }
            }

            state = state.advance(observation);

            if state.pauses_before_next_probe() {
                tokio::select! {
                    _ = sleep(self.poll_interval) => {}
                    _ = cancel.cancelled() => return WaitOutcome::Cancelled,
                }
            } else if cancel.is_cancelled() && !state.is_terminal() {
                return WaitOutcome::Cancelled;
            }
        }
    }
}

async fn probe_open(path: &Path) -> Observation {
    match tokio::fs::File::open(path).await {
        Ok(_) => Observation::Opened,
        Err(err) => Observation::OpenFailed(err.kind()),
    }
}

async fn probe_size(path: &Path) -> Observation {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => Observation::Size(metadata.len()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Observation::Missing,
        Err(err) => Observation::OpenFailed(err.kind()),
    }
}
