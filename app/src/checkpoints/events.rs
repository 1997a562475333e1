//! Events for the checkpoints module.
//!
//! Loading events mirror the state enum so consumers never have to poll.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::{CheckpointInventory, CheckpointRecord, LoadedCheckpointRef};

/// Checkpoint loading state change - single event stream for all load transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ModelLoadingStateChanged {
    /// No load pending; a redundant request was cancelled or the engine stopped
    #[serde(rename = "idle")]
    Idle,
    #[serde(rename = "started")]
    Started { title: String },
    /// `title` is unknown when completion was only seen in console output
    #[serde(rename = "complete")]
    Complete { title: Option<String> },
    #[serde(rename = "error")]
    Error { title: Option<String>, error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointInventoryChanged {
    pub checkpoints: Vec<CheckpointRecord>,
    pub recently_removed: Vec<CheckpointRecord>,
}

impl From<&CheckpointInventory> for CheckpointInventoryChanged {
    fn from(inventory: &CheckpointInventory) -> Self {
        Self {
            checkpoints: inventory.records().cloned().collect(),
            recently_removed: inventory.recently_removed().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadedCheckpointChanged {
    pub title: Option<String>,
    pub path: Option<PathBuf>,
}

impl From<Option<&LoadedCheckpointRef>> for LoadedCheckpointChanged {
    fn from(loaded: Option<&LoadedCheckpointRef>) -> Self {
        Self {
            title: loaded.map(|l| l.title.clone()),
            path: loaded.and_then(|l| l.path.clone()),
        }
    }
}
