use std::path::PathBuf;

use crate::clients::ClientError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    #[error("The engine is not running")]
    RemoteUnavailable,
    #[error("Could not decode the engine's response: {0}")]
    DecodeError(String),
    #[error(transparent)]
    TransportError(ClientError),
}

impl From<ClientError> for SyncError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Decode(detail) => SyncError::DecodeError(detail),
            other => SyncError::TransportError(other),
        }
    }
}

impl SyncError {
    /// Returns a user-friendly error message suitable for display in the UI
    pub fn user_message(&self) -> String {
        match self {
            SyncError::RemoteUnavailable => {
                "Start the engine to see which checkpoints it knows.".to_string()
            }
            SyncError::DecodeError(_) => {
                "The engine sent a checkpoint list we could not read.".to_string()
            }
            SyncError::TransportError(e) => e.user_message(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadError {
    #[error("The engine is not running")]
    RemoteUnavailable,
    #[error("Checkpoint {0} is not known to the engine yet")]
    MissingRemoteTitle(String),
    #[error("No checkpoint at {0:?}")]
    UnknownCheckpoint(PathBuf),
    #[error("The engine rejected the checkpoint: {0}")]
    ValidationError(String),
    #[error(transparent)]
    TransportError(ClientError),
    #[error("Engine reports {reported:?} instead of {expected}")]
    NotConfirmed {
        expected: String,
        reported: Option<String>,
    },
    #[error("A newer load request replaced this one")]
    Superseded,
}

impl From<ClientError> for LoadError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Validation(detail) => LoadError::ValidationError(detail),
            other => LoadError::TransportError(other),
        }
    }
}

impl LoadError {
    /// Returns a user-friendly error message suitable for display in the UI
    pub fn user_message(&self) -> String {
        match self {
            LoadError::RemoteUnavailable => "Start the engine before choosing a checkpoint.".to_string(),
            LoadError::MissingRemoteTitle(name) => format!(
                "The engine has not picked up '{}' yet. Try again in a moment.",
                name
            ),
            LoadError::UnknownCheckpoint(_) => {
                "That checkpoint is no longer in the model directory.".to_string()
            }
            LoadError::ValidationError(detail) => detail.clone(),
            LoadError::TransportError(_) => {
                "The checkpoint could not be loaded. Check the engine console.".to_string()
            }
            LoadError::NotConfirmed { expected, .. } => {
                format!("The engine did not switch to '{}'.", expected)
            }
            LoadError::Superseded => "Replaced by a newer selection.".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("No checkpoint at {0:?}")]
    UnknownCheckpoint(PathBuf),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("Already watching a directory")]
    AlreadyWatching,
    #[error("Not a directory: {0:?}")]
    NotADirectory(PathBuf),
}
