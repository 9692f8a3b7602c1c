//! Configuration file watcher.
//!
//! The file is re-read on every poll and on `SIGHUP`. A change is parsed,
//! validated and handed to the coordinator; a broken file is reported once
//! and the running configuration stays in place.

use std::path::{Path, PathBuf};
use std::time::Duration;

use jans_reload::{ConfigSnapshot, ReloadCoordinator, ReloadKind};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::ServerResult;

/// Polls a configuration file and reconfigures on change.
#[derive(Debug)]
pub struct ConfigWatcher {
    path: PathBuf,
    coordinator: ReloadCoordinator,
    interval: Option<Duration>,
    last_seen: Mutex<Option<String>>,
}

impl ConfigWatcher {
    /// Creates a watcher. `interval` of `None` disables polling.
    #[must_use]
    pub fn new(
        path: impl Into<PathBuf>,
        coordinator: ReloadCoordinator,
        interval: Option<Duration>,
    ) -> Self {
        Self {
            path: path.into(),
            coordinator,
            interval,
            last_seen: Mutex::new(None),
        }
    }

    /// Records `content` as already applied.
    pub fn mark_applied(&self, content: impl Into<String>) {
        *self.last_seen.lock() = Some(content.into());
    }

    /// Watched path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the file and reconfigures if its content changed.
    ///
    /// Returns the published `(kind, sequence)` pairs, empty when the file is
    /// unchanged or no section differs.
    pub async fn check_now(&self) -> ServerResult<Vec<(ReloadKind, u64)>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(jans_reload::ReloadError::from)?;
        {
            let mut last = self.last_seen.lock();
            if last.as_deref() == Some(content.as_str()) {
                return Ok(Vec::new());
            }
            *last = Some(content.clone());
        }
        let snapshot = ConfigSnapshot::from_toml_str(&content)?;
        Ok(self.coordinator.reconfigure_all(snapshot)?)
    }

    async fn check_and_log(&self) {
        match self.check_now().await {
            Ok(published) if !published.is_empty() => {
                tracing::info!(path = %self.path.display(), changes = published.len(), "configuration reloaded");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::error!(path = %self.path.display(), error = %err, "configuration rejected; keeping the running one");
            }
        }
    }

    /// Runs until `shutdown` flips or its sender drops.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut hangup = hangup_signal();
        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                () = poll_tick(self.interval) => self.check_and_log().await,
                () = next_hangup(&mut hangup) => {
                    tracing::info!("SIGHUP received");
                    self.check_and_log().await;
                }
            }
        }
        tracing::debug!("configuration watcher stopped");
    }
}

async fn poll_tick(interval: Option<Duration>) {
    match interval {
        Some(period) => tokio::time::sleep(period).await,
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
type Hangup = Option<tokio::signal::unix::Signal>;
#[cfg(not(unix))]
type Hangup = Option<()>;

#[cfg(unix)]
fn hangup_signal() -> Hangup {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::hangup()) {
        Ok(sig) => Some(sig),
        Err(err) => {
            tracing::warn!(error = %err, "SIGHUP handler unavailable");
            None
        }
    }
}

#[cfg(not(unix))]
fn hangup_signal() -> Hangup {
    None
}

#[cfg(unix)]
async fn next_hangup(hangup: &mut Hangup) {
    match hangup {
        Some(sig) => {
            if sig.recv().await.is_none() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending().await,
    }
}

#[cfg(not(unix))]
async fn next_hangup(_hangup: &mut Hangup) {
    std::future::pending().await
}
