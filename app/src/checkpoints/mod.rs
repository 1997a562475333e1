//! Local checkpoint files and their reconciliation with the engine.

mod error;
pub mod events;
mod inventory;
mod manager;
mod scanner;
mod status;
mod verify;
mod watcher;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::clients::RemoteCheckpoint;

pub use error::{LoadError, SyncError, VerifyError, WatchError};
pub use inventory::{titles_match, AttachSummary, CheckpointInventory, ScanDiff};
pub use manager::CheckpointSyncEngine;
pub use scanner::{is_checkpoint_file, scan_checkpoints, CHECKPOINT_EXTENSIONS};
pub use status::{ModelLoadState, ModelLoadStatus};
pub use verify::ChecksumStatus;
pub use watcher::{ChangeCallback, DirectoryWatcher, PollingWatcher};

/// One checkpoint file. The path is the identity; remote metadata is
/// attached when the engine reports a file with the same name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRecord {
    pub name: String,
    pub path: PathBuf,
    pub remote: Option<RemoteMetadata>,
}

impl CheckpointRecord {
    pub fn local(path: PathBuf) -> Self {
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Self {
            name,
            path,
            remote: None,
        }
    }

    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|name| name.to_str())
    }

    pub fn remote_title(&self) -> Option<&str> {
        self.remote.as_ref().map(|remote| remote.title.as_str())
    }

    pub fn is_at(&self, path: &Path) -> bool {
        self.path == path
    }
}

/// What the engine knows about a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMetadata {
    /// Identifier the engine expects when asked to load this checkpoint
    pub title: String,
    pub model_name: String,
    pub filename: String,
    pub hash: Option<String>,
    pub sha256: Option<String>,
    pub config: Option<String>,
}

impl From<&RemoteCheckpoint> for RemoteMetadata {
    fn from(remote: &RemoteCheckpoint) -> Self {
        Self {
            title: remote.title.clone(),
            model_name: remote.model_name.clone(),
            filename: remote.filename.clone(),
            hash: remote.hash.clone(),
            sha256: remote.sha256.clone(),
            config: remote.config.clone(),
        }
    }
}

/// The checkpoint the engine reports as loaded, and the local file it
/// resolved to, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadedCheckpointRef {
    pub title: String,
    pub path: Option<PathBuf>,
}
