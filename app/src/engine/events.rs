//! Events for the engine module.
//!
//! Uses discriminated unions (tagged enums) so consumers can switch on
//! `state` without inspecting the payload.

use serde::{Deserialize, Serialize};

use super::progress::{GenerationPhase, GenerationProgress};
use super::state_manager::EngineState;

/// Engine lifecycle change - single event stream for all transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum EngineStateChanged {
    Idle,
    UnableToLocate { reason: String },
    Launching,
    Active { url: String },
    /// `abnormal` is false for user-requested and forced termination
    Terminated { abnormal: bool },
    Failed { reason: String },
}

impl From<&EngineState> for EngineStateChanged {
    fn from(state: &EngineState) -> Self {
        match state {
            EngineState::Idle => Self::Idle,
            EngineState::UnableToLocate(reason) => Self::UnableToLocate {
                reason: reason.clone(),
            },
            EngineState::Launching => Self::Launching,
            EngineState::Active(url) => Self::Active {
                url: url.to_string(),
            },
            EngineState::Terminated { abnormal } => Self::Terminated {
                abnormal: *abnormal,
            },
            EngineState::Failed(reason) => Self::Failed {
                reason: reason.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationProgressChanged {
    pub progress: f64,
    pub phase: GenerationPhase,
}

impl From<GenerationProgress> for GenerationProgressChanged {
    fn from(progress: GenerationProgress) -> Self {
        Self {
            progress: progress.value,
            phase: progress.phase,
        }
    }
}

/// One complete line of engine console output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleOutput {
    /// "stdout" | "stderr"
    pub stream: String,
    pub text: String,
}
