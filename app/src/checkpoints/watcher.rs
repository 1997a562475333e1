//! Directory change notifications.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use log::{debug, info};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::error::WatchError;

pub type ChangeCallback = Box<dyn Fn() + Send + Sync>;

/// Notifies when anything below a directory changes.
pub trait DirectoryWatcher: Send + Sync {
    fn watch(&self, path: &Path, on_change: ChangeCallback) -> Result<(), WatchError>;
    fn unwatch(&self);
}

type Snapshot = BTreeMap<PathBuf, (Option<SystemTime>, u64)>;

fn snapshot(dir: &Path) -> Snapshot {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let meta = entry.metadata().ok()?;
            Some((entry.into_path(), (meta.modified().ok(), meta.len())))
        })
        .collect()
}

/// Compares directory snapshots on a fixed interval. Needs a tokio runtime.
pub struct PollingWatcher {
    interval: Duration,
    active: Mutex<Option<CancellationToken>>,
}

impl PollingWatcher {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            active: Mutex::new(None),
        }
    }

    pub fn is_watching(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl DirectoryWatcher for PollingWatcher {
    fn watch(&self, path: &Path, on_change: ChangeCallback) -> Result<(), WatchError> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.is_some() {
            return Err(WatchError::AlreadyWatching);
        }
        if !path.is_dir() {
            return Err(WatchError::NotADirectory(path.to_path_buf()));
        }

        let token = CancellationToken::new();
        let cancel = token.clone();
        let dir = path.to_path_buf();
        let interval = self.interval;

        tokio::spawn(async move {
            let mut previous = snapshot(&dir);
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let scan_dir = dir.clone();
                let Ok(current) = tokio::task::spawn_blocking(move || snapshot(&scan_dir)).await
                else {
                    continue;
                };
                if current != previous {
                    debug!("Change detected under {:?}", dir);
                    previous = current;
                    on_change();
                }
            }
            debug!("Stopped watching {:?}", dir);
        });

        info!("Watching {:?} every {:?}", path, interval);
        *active = Some(token);
        Ok(())
    }

    fn unwatch(&self) {
        if let Some(token) = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
    }
}

impl Drop for PollingWatcher {
    fn drop(&mut self) {
        self.unwatch();
    }
}
