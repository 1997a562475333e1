use easel_process::ProcessError;

use crate::config::LaunchInputError;

use super::state_manager::TransitionRejection;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Unable to locate the engine: {0}")]
    UnableToLocate(#[from] LaunchInputError),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Rejected(#[from] TransitionRejection),
    #[error("The engine controller has stopped")]
    ControllerStopped,
}

impl EngineError {
    /// Returns a user-friendly error message suitable for display in the UI
    pub fn user_message(&self) -> String {
        match self {
            EngineError::UnableToLocate(LaunchInputError::ScriptPathNotSet) => {
                "Choose the engine's launch script in Settings.".to_string()
            }
            EngineError::UnableToLocate(LaunchInputError::ModelDirectoryNotSet) => {
                "Choose a model directory in Settings.".to_string()
            }
            EngineError::UnableToLocate(e) => format!("{}. Check your Settings.", e),
            EngineError::Process(ProcessError::AlreadyRunning) => {
                "The engine is already running.".to_string()
            }
            EngineError::Process(ProcessError::SpawnFailed(e)) => {
                format!("The engine could not be started: {}", e)
            }
            EngineError::Process(e) => format!("Engine process error: {}", e),
            EngineError::Rejected(rejection) => {
                format!("Not possible while the engine is {}.", rejection.current_state)
            }
            EngineError::ControllerStopped => {
                "The application is shutting down.".to_string()
            }
        }
    }
}
