use serde::{Deserialize, Serialize};

/// Progress of the latest checkpoint load request.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "camelCase")]
pub enum ModelLoadState {
    #[default]
    Idle,
    Loading,
    Done,
    Failed,
}

/// Load state plus the message of the last failure, held in the shared state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelLoadStatus {
    pub state: ModelLoadState,
    /// User-facing failure detail, set only in `Failed`
    pub error: Option<String>,
}
