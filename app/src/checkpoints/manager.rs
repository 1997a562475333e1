use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, sleep_until, Instant, Interval};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::clients::RemoteEngineClient;
use crate::config::{
    CheckpointSelection, Config, ConfigKey, ConfigStore, EngineConfig, SyncConfig,
};
use crate::engine::EngineObserver;
use crate::persistence::RecordStore;
use crate::state::{LoadTicket, SharedState};

use super::error::{LoadError, SyncError, VerifyError, WatchError};
use super::inventory::{titles_match, AttachSummary, ScanDiff};
use super::scanner::scan_checkpoints;
use super::verify::{compare_checksum, ChecksumStatus};
use super::watcher::DirectoryWatcher;
use super::CheckpointRecord;

/// The watcher following the model directory and where it reports changes.
struct WatchBinding {
    watcher: Arc<dyn DirectoryWatcher>,
    notify: mpsc::UnboundedSender<()>,
}

/// Keeps the checkpoint inventory in step with the model directory and the
/// engine, and mediates load requests.
///
/// Everything observable lives in [`SharedState`]; only the model directory
/// and its watcher are kept here.
pub struct CheckpointSyncEngine {
    state: SharedState,
    client: Arc<dyn RemoteEngineClient>,
    model_directory: RwLock<PathBuf>,
    watch: Mutex<Option<WatchBinding>>,
    sync: SyncConfig,
    records: Arc<dyn RecordStore<CheckpointRecord>>,
    config: Config,
}

impl CheckpointSyncEngine {
    pub fn new(
        state: SharedState,
        client: Arc<dyn RemoteEngineClient>,
        model_directory: PathBuf,
        sync: SyncConfig,
        records: Arc<dyn RecordStore<CheckpointRecord>>,
        config: Config,
    ) -> Self {
        Self {
            state,
            client,
            model_directory: RwLock::new(model_directory),
            watch: Mutex::new(None),
            sync,
            records,
            config,
        }
    }

    pub fn model_directory(&self) -> PathBuf {
        self.model_directory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Follows the model directory with `watcher`. Changes, and directory
    /// switches, arrive on the returned channel for [`run_watch_loop`](Self::run_watch_loop).
    pub fn attach_watcher(
        &self,
        watcher: Arc<dyn DirectoryWatcher>,
    ) -> Result<mpsc::UnboundedReceiver<()>, WatchError> {
        let (notify, changes) = mpsc::unbounded_channel();
        let mut watch = self.watch.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = watch.take() {
            previous.watcher.unwatch();
        }
        let binding = watch.insert(WatchBinding { watcher, notify });
        self.watch_directory(binding)?;
        Ok(changes)
    }

    pub fn unwatch(&self) {
        if let Some(binding) = self
            .watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            binding.watcher.unwatch();
        }
    }

    /// Points the sync engine at another model directory. The watcher follows
    /// and the watch loop rescans. Returns false if nothing changed.
    pub fn set_model_directory(&self, dir: PathBuf) -> bool {
        {
            let mut current = self
                .model_directory
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if *current == dir {
                return false;
            }
            info!("Model directory changed from {:?} to {:?}", current, dir);
            *current = dir;
        }

        let watch = self.watch.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(binding) = watch.as_ref() {
            binding.watcher.unwatch();
            if let Err(e) = self.watch_directory(binding) {
                warn!("Could not watch the new model directory: {}", e);
            }
            let _ = binding.notify.send(());
        }
        true
    }

    fn watch_directory(&self, binding: &WatchBinding) -> Result<(), WatchError> {
        let dir = self.model_directory();
        if !dir.is_dir() {
            warn!("Model directory {:?} is not available, not watching it", dir);
            return Ok(());
        }
        let notify = binding.notify.clone();
        binding.watcher.watch(
            &dir,
            Box::new(move || {
                let _ = notify.send(());
            }),
        )
    }

    /// Brings the local side of the inventory in line with the directory.
    pub async fn rescan_local_directory(&self) -> ScanDiff {
        let dir = self.model_directory();
        let scanned = match tokio::task::spawn_blocking(move || scan_checkpoints(&dir)).await {
            Ok(scanned) => scanned,
            Err(e) => {
                error!("Checkpoint scan task failed: {}", e);
                return ScanDiff::default();
            }
        };

        let diff = self.state.apply_scan(scanned);
        if !diff.is_empty() {
            info!(
                "Checkpoint scan: {} added, {} removed",
                diff.added.len(),
                diff.removed.len()
            );
        }
        diff
    }

    /// Refreshes and fetches the engine's checkpoint list and attaches its
    /// metadata to local records. On failure the inventory is untouched.
    pub async fn reconcile_with_remote(&self) -> Result<AttachSummary, SyncError> {
        let base = self.state.active_url().ok_or(SyncError::RemoteUnavailable)?;

        self.client.refresh_checkpoints(&base).await?;
        let remote = self.client.list_checkpoints(&base).await?;

        // The engine may have gone away while the calls were in flight.
        if self.state.active_url().as_ref() != Some(&base) {
            return Err(SyncError::RemoteUnavailable);
        }

        let summary = self.state.attach_remote(&remote);
        debug!(
            "Reconciled {} remote checkpoints, {} matched locally",
            remote.len(),
            summary.matched
        );
        self.persist_matched();
        Ok(summary)
    }

    /// Asks the engine which checkpoint is loaded and resolves it locally.
    pub async fn fetch_loaded_checkpoint(&self) -> Result<Option<CheckpointRecord>, SyncError> {
        let base = self.state.active_url().ok_or(SyncError::RemoteUnavailable)?;
        let title = self.client.loaded_checkpoint(&base).await?;
        Ok(self.state.set_loaded_title(title))
    }

    /// Loads the checkpoint at `path` into the engine.
    ///
    /// A newer request supersedes this one: its outcome is then discarded and
    /// `Superseded` is returned. Requesting the checkpoint that is already
    /// loaded issues nothing and returns the load state to Idle.
    pub async fn request_load(&self, path: &Path) -> Result<(), LoadError> {
        let base = self.state.active_url().ok_or(LoadError::RemoteUnavailable)?;
        let record = self
            .state
            .checkpoint(path)
            .ok_or_else(|| LoadError::UnknownCheckpoint(path.to_path_buf()))?;
        self.remember_selection(path);

        if self.state.cancel_if_loaded(&record) {
            info!("{} is already loaded", record.name);
            return Ok(());
        }

        let Some(title) = record.remote_title().map(str::to_string) else {
            let ticket = self.state.begin_load(path, &record.name);
            let error = LoadError::MissingRemoteTitle(record.name.clone());
            warn!("Cannot load {}: {}", record.name, error);
            self.state.finish_load(&ticket, Err(error.user_message()));
            return Err(error);
        };

        let ticket = self.state.begin_load(path, &title);
        info!("Loading checkpoint {}", title);
        let outcome = self.perform_load(&base, &ticket).await;

        if let Err(LoadError::Superseded) = outcome {
            debug!("Load of {} superseded", title);
            return outcome;
        }
        let published = self.state.finish_load(
            &ticket,
            outcome.as_ref().map(|_| ()).map_err(LoadError::user_message),
        );
        if !published {
            return Err(LoadError::Superseded);
        }

        match &outcome {
            Ok(()) => info!("Checkpoint {} loaded", title),
            Err(e) => warn!("Loading {} failed: {}", title, e),
        }
        outcome
    }

    async fn perform_load(&self, base: &Url, ticket: &LoadTicket) -> Result<(), LoadError> {
        self.client.set_loaded_checkpoint(base, &ticket.title).await?;

        let mut reported = None;
        let mut last_error = None;
        for attempt in 0..self.sync.confirm_attempts.max(1) {
            if attempt > 0 {
                sleep(self.sync.confirm_interval()).await;
            }
            if !self.state.is_current_load(ticket) {
                return Err(LoadError::Superseded);
            }

            match self.client.loaded_checkpoint(base).await {
                Ok(Some(title)) if titles_match(&title, &ticket.title) => return Ok(()),
                Ok(title) => {
                    debug!(
                        "Engine reports {:?} while loading {} (attempt {})",
                        title,
                        ticket.title,
                        attempt + 1
                    );
                    reported = title;
                    last_error = None;
                }
                Err(e) => {
                    warn!("Load confirmation for {} failed: {}", ticket.title, e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(e.into()),
            None => Err(LoadError::NotConfirmed {
                expected: ticket.title.clone(),
                reported,
            }),
        }
    }

    /// Compares the local file with the sha256 the engine reported.
    pub async fn verify_checkpoint(&self, path: &Path) -> Result<ChecksumStatus, VerifyError> {
        let record = self
            .state
            .checkpoint(path)
            .ok_or_else(|| VerifyError::UnknownCheckpoint(path.to_path_buf()))?;
        let expected = record.remote.as_ref().and_then(|r| r.sha256.as_deref());
        Ok(compare_checksum(path, expected).await?)
    }

    /// One debounced directory change: rescan, then reconcile if the engine
    /// is reachable.
    pub async fn handle_directory_change(&self) -> ScanDiff {
        let diff = self.rescan_local_directory().await;
        if self.state.engine().is_active() {
            if let Err(e) = self.reconcile_with_remote().await {
                warn!("Reconciliation after directory change failed: {}", e);
            }
        }
        diff
    }

    /// Consumes change notifications until shutdown. Changes arriving within
    /// the debounce window of the first one are handled as one.
    pub async fn run_watch_loop(
        self: Arc<Self>,
        mut changes: mpsc::UnboundedReceiver<()>,
        shutdown: CancellationToken,
    ) {
        let mut periodic = self
            .sync
            .periodic_reconcile()
            .map(|period| interval_at(Instant::now() + period, period));

        let mut watching = true;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                change = changes.recv(), if watching => {
                    if change.is_none() {
                        debug!("Directory notifications ended");
                        watching = false;
                        continue;
                    }
                    let coalesced = coalesce(&mut changes, self.sync.debounce()).await;
                    debug!("Handling {} directory change notifications", coalesced);
                    self.handle_directory_change().await;
                }

                _ = next_tick(&mut periodic) => {
                    if self.state.engine().is_active() {
                        if let Err(e) = self.reconcile_with_remote().await {
                            warn!("Periodic reconciliation failed: {}", e);
                        }
                    }
                }
            }
        }
        debug!("Checkpoint watch loop stopped");
    }

    /// Seeds remote metadata from the cache for files still on disk.
    pub fn restore_cached_records(&self) -> usize {
        let present: BTreeSet<PathBuf> = self
            .state
            .inventory()
            .records()
            .map(|record| record.path.clone())
            .collect();
        match self
            .records
            .fetch(&|record: &CheckpointRecord| present.contains(&record.path))
        {
            Ok(cached) => {
                let restored = self.state.restore_remote(&cached);
                if restored > 0 {
                    info!("Restored cached metadata for {} checkpoints", restored);
                }
                restored
            }
            Err(e) => {
                warn!("Failed to read checkpoint cache: {}", e);
                0
            }
        }
    }

    /// Re-requests the checkpoint the user picked last, if it still exists.
    pub async fn restore_selection(&self) -> Option<Result<(), LoadError>> {
        let selection: CheckpointSelection =
            self.config.get(&ConfigKey::SELECTION).unwrap_or_default();
        let path = selection.selected_checkpoint?;
        if self.state.checkpoint(&path).is_none() {
            debug!("Selected checkpoint {:?} is gone", path);
            return None;
        }
        Some(self.request_load(&path).await)
    }

    fn remember_selection(&self, path: &Path) {
        let selection = CheckpointSelection {
            selected_checkpoint: Some(path.to_path_buf()),
        };
        if let Err(e) = self.config.set(&ConfigKey::SELECTION, selection) {
            warn!("Failed to store checkpoint selection: {}", e);
        }
    }

    fn persist_matched(&self) {
        if let Err(e) = self.records.save_all(&self.state.matched_records()) {
            warn!("Failed to cache checkpoint metadata: {}", e);
        }
    }
}

/// Swallows further notifications until `window` has passed since the
/// first. Returns how many were coalesced, the first included.
async fn coalesce(changes: &mut mpsc::UnboundedReceiver<()>, window: std::time::Duration) -> usize {
    let deadline = Instant::now() + window;
    let mut count = 1;
    loop {
        tokio::select! {
            _ = sleep_until(deadline) => return count,
            more = changes.recv() => match more {
                Some(()) => count += 1,
                None => return count,
            },
        }
    }
}

async fn next_tick(periodic: &mut Option<Interval>) {
    match periodic {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[async_trait]
impl EngineObserver for CheckpointSyncEngine {
    async fn engine_activated(&self, url: &Url) {
        info!("Engine reachable at {}, syncing checkpoints", url);
        self.rescan_local_directory().await;
        if let Err(e) = self.reconcile_with_remote().await {
            warn!("Initial reconciliation failed: {}", e);
        }
        if let Err(e) = self.fetch_loaded_checkpoint().await {
            warn!("Could not read the loaded checkpoint: {}", e);
        }
        if let Some(Err(e)) = self.restore_selection().await {
            warn!("Could not restore the selected checkpoint: {}", e);
        }
    }

    async fn engine_stopped(&self) {
        debug!("Engine stopped, checkpoint sync idle");
    }

    fn engine_reconfigured(&self, config: &EngineConfig) {
        if let Some(dir) = &config.model_directory {
            self.set_model_directory(dir.clone());
        }
    }
}
