//! The single mutable state shared by the engine controller, the checkpoint
//! sync engine and readers.
//!
//! Everything sits behind one mutex so a rescan and a load confirmation can
//! never interleave half-applied updates. The lock is only held for the
//! mutation itself and the matching event emission, never across I/O.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info};
use url::Url;

use crate::checkpoints::events::{
    CheckpointInventoryChanged, LoadedCheckpointChanged, ModelLoadingStateChanged,
};
use crate::checkpoints::{
    AttachSummary, CheckpointInventory, CheckpointRecord, LoadedCheckpointRef, ModelLoadState,
    ModelLoadStatus, ScanDiff,
};
use crate::clients::RemoteCheckpoint;
use crate::engine::events::GenerationProgressChanged;
use crate::engine::{EngineState, GenerationProgress};
use crate::events::{Event, EventBus};
use crate::parser::LoadOutcome;

#[derive(Debug, Default)]
pub(crate) struct CoreState {
    pub(crate) engine: EngineState,
    progress: GenerationProgress,
    model_load: ModelLoadStatus,
    inventory: CheckpointInventory,
    loaded: Option<LoadedCheckpointRef>,
    /// Bumped by every new load request; results carrying an older
    /// generation are discarded.
    load_generation: u64,
    load_in_flight: Option<u64>,
}

/// Proof that a load request was issued, checked again when it completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadTicket {
    generation: u64,
    pub path: PathBuf,
    pub title: String,
}

#[derive(Debug, Clone)]
pub struct SharedState {
    inner: Arc<Mutex<CoreState>>,
    bus: EventBus,
}

impl SharedState {
    pub fn new(bus: EventBus) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CoreState::default())),
            bus,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ===== Engine =====

    pub fn engine(&self) -> EngineState {
        self.lock().engine.clone()
    }

    /// The engine's URL while it is Active.
    pub fn active_url(&self) -> Option<Url> {
        self.lock().engine.service_url().cloned()
    }

    // ===== Generation progress =====

    pub fn progress(&self) -> GenerationProgress {
        self.lock().progress
    }

    pub fn observe_progress(&self, fraction: f64) {
        let mut core = self.lock();
        if core.progress.observe(fraction) {
            let _ = GenerationProgressChanged::from(core.progress).emit(&self.bus);
        }
    }

    pub fn reset_progress(&self) {
        let mut core = self.lock();
        if core.progress.reset() {
            let _ = GenerationProgressChanged::from(core.progress).emit(&self.bus);
        }
    }

    // ===== Model loading =====

    pub fn model_load(&self) -> ModelLoadStatus {
        self.lock().model_load.clone()
    }

    /// Starts a new load, superseding any request still in flight.
    pub fn begin_load(&self, path: &Path, title: &str) -> LoadTicket {
        let mut core = self.lock();
        core.load_generation += 1;
        let generation = core.load_generation;
        if let Some(previous) = core.load_in_flight.replace(generation) {
            info!("Load request {} superseded by {}", previous, generation);
        }
        core.model_load = ModelLoadStatus {
            state: ModelLoadState::Loading,
            error: None,
        };
        let _ = ModelLoadingStateChanged::Started {
            title: title.to_string(),
        }
        .emit(&self.bus);

        LoadTicket {
            generation,
            path: path.to_path_buf(),
            title: title.to_string(),
        }
    }

    pub fn is_current_load(&self, ticket: &LoadTicket) -> bool {
        self.lock().load_in_flight == Some(ticket.generation)
    }

    /// Publishes the outcome of `ticket` unless a newer request superseded
    /// it. Returns false when the outcome was discarded.
    pub fn finish_load(&self, ticket: &LoadTicket, outcome: Result<(), String>) -> bool {
        let mut core = self.lock();
        if core.load_in_flight != Some(ticket.generation) {
            debug!(
                "Discarding outcome of superseded load {} ({})",
                ticket.generation, ticket.title
            );
            return false;
        }
        core.load_in_flight = None;

        match outcome {
            Ok(()) => {
                core.model_load = ModelLoadStatus {
                    state: ModelLoadState::Done,
                    error: None,
                };
                core.loaded = Some(LoadedCheckpointRef {
                    title: ticket.title.clone(),
                    path: Some(ticket.path.clone()),
                });
                let _ = ModelLoadingStateChanged::Complete {
                    title: Some(ticket.title.clone()),
                }
                .emit(&self.bus);
                let _ = LoadedCheckpointChanged::from(core.loaded.as_ref()).emit(&self.bus);
            }
            Err(error) => {
                core.model_load = ModelLoadStatus {
                    state: ModelLoadState::Failed,
                    error: Some(error.clone()),
                };
                let _ = ModelLoadingStateChanged::Error {
                    title: Some(ticket.title.clone()),
                    error,
                }
                .emit(&self.bus);
            }
        }
        true
    }

    /// If `record` is the checkpoint already confirmed loaded, cancels any
    /// in-flight request and returns the load state to Idle.
    pub fn cancel_if_loaded(&self, record: &CheckpointRecord) -> bool {
        let mut core = self.lock();
        let already_loaded = core
            .loaded
            .as_ref()
            .and_then(|loaded| loaded.path.as_deref())
            .is_some_and(|path| record.is_at(path));
        if !already_loaded {
            return false;
        }

        core.load_generation += 1;
        core.load_in_flight = None;
        self.set_load_idle(&mut core);
        true
    }

    /// Applies a load marker seen in console output. Ignored while a request
    /// is in flight; its own confirmation decides.
    pub fn apply_load_marker(&self, outcome: LoadOutcome) {
        let mut core = self.lock();
        if core.load_in_flight.is_some() {
            debug!("Ignoring {} marker while a load request is in flight", outcome);
            return;
        }

        let title = core.loaded.as_ref().map(|loaded| loaded.title.clone());
        let status = match outcome {
            LoadOutcome::Success => ModelLoadStatus {
                state: ModelLoadState::Done,
                error: None,
            },
            LoadOutcome::Failure => ModelLoadStatus {
                state: ModelLoadState::Failed,
                error: Some("The engine reported that the checkpoint failed to load.".to_string()),
            },
        };
        if core.model_load == status {
            return;
        }
        core.model_load = status;

        let event = match outcome {
            LoadOutcome::Success => ModelLoadingStateChanged::Complete { title },
            LoadOutcome::Failure => ModelLoadingStateChanged::Error {
                title,
                error: core.model_load.error.clone().unwrap_or_default(),
            },
        };
        let _ = event.emit(&self.bus);
    }

    /// The engine process is gone: pending loads are void, nothing is loaded
    /// and progress starts over.
    pub fn end_engine_session(&self) {
        let mut core = self.lock();
        core.load_generation += 1;
        core.load_in_flight = None;
        self.set_load_idle(&mut core);

        if core.loaded.take().is_some() {
            let _ = LoadedCheckpointChanged::from(None).emit(&self.bus);
        }
        if core.progress.reset() {
            let _ = GenerationProgressChanged::from(core.progress).emit(&self.bus);
        }
    }

    fn set_load_idle(&self, core: &mut CoreState) {
        if core.model_load != ModelLoadStatus::default() {
            core.model_load = ModelLoadStatus::default();
            let _ = ModelLoadingStateChanged::Idle.emit(&self.bus);
        }
    }

    // ===== Inventory =====

    pub fn inventory(&self) -> CheckpointInventory {
        self.lock().inventory.clone()
    }

    pub fn checkpoint(&self, path: &Path) -> Option<CheckpointRecord> {
        self.lock().inventory.get(path).cloned()
    }

    pub fn matched_records(&self) -> Vec<CheckpointRecord> {
        self.lock().inventory.matched_records()
    }

    pub fn apply_scan(&self, scanned: Vec<PathBuf>) -> ScanDiff {
        let mut core = self.lock();
        let diff = core.inventory.apply_scan(scanned);
        if !diff.is_empty() {
            self.resolve_loaded(&mut core);
            self.emit_inventory(&core);
        }
        diff
    }

    pub fn attach_remote(&self, remote: &[RemoteCheckpoint]) -> AttachSummary {
        let mut core = self.lock();
        let summary = core.inventory.attach_remote(remote);
        if summary.changed {
            self.resolve_loaded(&mut core);
            self.emit_inventory(&core);
        }
        summary
    }

    pub fn restore_remote(&self, cached: &[CheckpointRecord]) -> usize {
        let mut core = self.lock();
        let restored = core.inventory.restore_remote(cached);
        if restored > 0 {
            self.resolve_loaded(&mut core);
            self.emit_inventory(&core);
        }
        restored
    }

    pub fn clear_recently_removed(&self) {
        let mut core = self.lock();
        if core.inventory.clear_recently_removed() {
            self.emit_inventory(&core);
        }
    }

    fn emit_inventory(&self, core: &CoreState) {
        let _ = CheckpointInventoryChanged::from(&core.inventory).emit(&self.bus);
    }

    // ===== Loaded checkpoint =====

    pub fn loaded(&self) -> Option<LoadedCheckpointRef> {
        self.lock().loaded.clone()
    }

    /// Records the title the engine reports as loaded and resolves it against
    /// the inventory. Returns the matching local record, if any.
    pub fn set_loaded_title(&self, title: Option<String>) -> Option<CheckpointRecord> {
        let mut core = self.lock();
        let record = title
            .as_deref()
            .and_then(|title| core.inventory.find_by_title(title))
            .cloned();
        let loaded = title.map(|title| LoadedCheckpointRef {
            title,
            path: record.as_ref().map(|record| record.path.clone()),
        });

        if core.loaded != loaded {
            core.loaded = loaded;
            let _ = LoadedCheckpointChanged::from(core.loaded.as_ref()).emit(&self.bus);
        }
        record
    }

    /// Re-resolves the loaded title after the inventory changed.
    fn resolve_loaded(&self, core: &mut CoreState) {
        let Some(loaded) = core.loaded.as_ref() else {
            return;
        };
        let path = core
            .inventory
            .find_by_title(&loaded.title)
            .map(|record| record.path.clone())
            .or_else(|| {
                // Keep a confirmed path while its file is still present.
                loaded
                    .path
                    .clone()
                    .filter(|path| core.inventory.get(path).is_some())
            });
        if path != loaded.path {
            if let Some(loaded) = core.loaded.as_mut() {
                loaded.path = path;
            }
            let _ = LoadedCheckpointChanged::from(core.loaded.as_ref()).emit(&self.bus);
        }
    }
}
