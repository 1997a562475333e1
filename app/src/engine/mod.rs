mod commands;
mod controller;
mod error;
pub mod events;
mod observer;
mod progress;
mod state_manager;

// Public exports
pub use commands::{EngineCommand, EngineHandle};
pub use controller::EngineController;
pub use error::EngineError;
pub use observer::EngineObserver;
pub use progress::{GenerationPhase, GenerationProgress};
pub use state_manager::{
    EngineAction, EngineEvent, EngineState, EngineStateMachine, TransitionRejection,
    TransitionResult,
};
