//! Engine lifecycle state machine - single source of truth for valid transitions
//!
//! State diagram:
//! ```text
//!                  ┌──────── LaunchInputsInvalid ───────┐
//!                  │                                    ↓
//! Idle ──Start──> Launching ──ServiceDiscovered──> Active(url)   UnableToLocate
//!  ↑                 │  │                             │
//!  │          SpawnFailed  ProcessExited/Terminate    ProcessExited/Terminate
//!  │                 ↓  ↓                             ↓
//!  │            Failed   Terminated { abnormal } <────┘
//!  │
//!  └─ Terminated, Failed and UnableToLocate accept Start again.
//! ```
//!
//! `ForceKill` is accepted in every state and always ends in `Terminated`.

use std::fmt;

use url::Url;

use crate::engine::events::EngineStateChanged;
use crate::events::Event;
use crate::state::SharedState;

/// Events that can trigger state transitions
#[derive(Debug, Clone, PartialEq, Eq, strum::Display)]
pub enum EngineEvent {
    /// User asked to launch the engine with valid inputs
    Start,
    /// User asked to launch but the script or model directory is unusable
    LaunchInputsInvalid(String),
    /// The OS refused to create the process
    SpawnFailed(String),
    /// Output revealed the engine's HTTP endpoint
    ServiceDiscovered(Url),
    /// The owned process ended
    ProcessExited { abnormal: bool },
    /// User asked for graceful termination
    Terminate,
    /// Forced recovery, kills every engine process on the system
    ForceKill,
}

/// Actions the controller performs after a state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineAction {
    SpawnProcess,
    StopProcess,
    KillAllMatching,
    /// Engine became reachable; observers start reconciling
    BeginSync,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EngineState {
    #[default]
    Idle,
    UnableToLocate(String),
    Launching,
    Active(Url),
    Terminated {
        abnormal: bool,
    },
    Failed(String),
}

impl EngineState {
    pub fn service_url(&self) -> Option<&Url> {
        match self {
            EngineState::Active(url) => Some(url),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, EngineState::Active(_))
    }

    /// Launching or Active: a process is expected to be alive.
    pub fn is_running(&self) -> bool {
        matches!(self, EngineState::Launching | EngineState::Active(_))
    }

    pub fn can_start(&self) -> bool {
        !self.is_running()
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Idle => write!(f, "Idle"),
            EngineState::UnableToLocate(_) => write!(f, "UnableToLocate"),
            EngineState::Launching => write!(f, "Launching"),
            EngineState::Active(url) => write!(f, "Active({})", url),
            EngineState::Terminated { abnormal: true } => write!(f, "Terminated(abnormal)"),
            EngineState::Terminated { abnormal: false } => write!(f, "Terminated"),
            EngineState::Failed(_) => write!(f, "Failed"),
        }
    }
}

/// Result of a successful state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    Changed {
        from: EngineState,
        to: EngineState,
        action: Option<EngineAction>,
    },
    /// Event was valid but state didn't change
    Unchanged,
}

/// Reason a transition was rejected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{attempted_event} event rejected in {current_state} state")]
pub struct TransitionRejection {
    pub current_state: EngineState,
    pub attempted_event: EngineEvent,
}

/// Engine lifecycle view over the shared core state.
///
/// Cheap to clone; all clones observe and mutate the same state.
#[derive(Debug, Clone)]
pub struct EngineStateMachine {
    shared: SharedState,
}

impl EngineStateMachine {
    pub fn new(shared: SharedState) -> Self {
        Self { shared }
    }

    pub fn current(&self) -> EngineState {
        self.shared.engine()
    }

    /// Attempt a state transition based on an event
    ///
    /// This is the ONLY way to change engine state. The change is published
    /// while the state lock is held so observers see transitions in order.
    pub fn transition(&self, event: EngineEvent) -> Result<TransitionResult, TransitionRejection> {
        let mut core = self.shared.lock();
        let current = core.engine.clone();

        match compute_transition(&current, &event) {
            Some((new_state, action)) => {
                if new_state == current {
                    return Ok(TransitionResult::Unchanged);
                }

                core.engine = new_state.clone();
                let _ = EngineStateChanged::from(&new_state).emit(self.shared.bus());
                Ok(TransitionResult::Changed {
                    from: current,
                    to: new_state,
                    action,
                })
            }
            None => Err(TransitionRejection {
                current_state: current,
                attempted_event: event,
            }),
        }
    }
}

/// Pure function: compute what transition should happen (if any)
/// Returns None if the transition is invalid
fn compute_transition(
    current: &EngineState,
    event: &EngineEvent,
) -> Option<(EngineState, Option<EngineAction>)> {
    use EngineState as S;

    if let EngineEvent::ForceKill = event {
        return Some((
            S::Terminated { abnormal: false },
            Some(EngineAction::KillAllMatching),
        ));
    }

    match current {
        S::Idle | S::UnableToLocate(_) | S::Terminated { .. } | S::Failed(_) => match event {
            EngineEvent::Start => Some((S::Launching, Some(EngineAction::SpawnProcess))),
            EngineEvent::LaunchInputsInvalid(reason) => Some((S::UnableToLocate(reason.clone()), None)),
            // Late exit report of a run that was already terminated or failed.
            EngineEvent::ProcessExited { .. } if !matches!(current, S::Idle) => {
                Some((current.clone(), None))
            }
            _ => None,
        },

        S::Launching => match event {
            EngineEvent::ServiceDiscovered(url) => {
                Some((S::Active(url.clone()), Some(EngineAction::BeginSync)))
            }
            EngineEvent::SpawnFailed(reason) => Some((S::Failed(reason.clone()), None)),
            EngineEvent::ProcessExited { abnormal } => {
                Some((S::Terminated { abnormal: *abnormal }, None))
            }
            EngineEvent::Terminate => Some((
                S::Terminated { abnormal: false },
                Some(EngineAction::StopProcess),
            )),
            _ => None,
        },

        S::Active(_) => match event {
            // The engine sometimes repeats its URL banner.
            EngineEvent::ServiceDiscovered(_) => Some((current.clone(), None)),
            EngineEvent::ProcessExited { abnormal } => {
                Some((S::Terminated { abnormal: *abnormal }, None))
            }
            EngineEvent::Terminate => Some((
                S::Terminated { abnormal: false },
                Some(EngineAction::StopProcess),
            )),
            _ => None,
        },
    }
}
