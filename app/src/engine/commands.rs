use easel_process::KillOutput;
use tokio::sync::{mpsc, oneshot};

use crate::config::EngineConfig;

use super::error::EngineError;
use super::state_manager::EngineEvent;

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// Commands for controlling the engine.
/// Sent through a channel to the controller task, which owns the process.
#[derive(Debug)]
pub enum EngineCommand {
    /// Launch the engine with the current configuration
    Start { reply: Reply<()> },
    /// Ask the engine to shut down; forced recovery follows on timeout
    Terminate { reply: Reply<()> },
    /// Kill every engine process on the system
    ForceKill { reply: Reply<KillOutput> },
    /// Replace the launch configuration used by the next start
    Configure {
        config: Box<EngineConfig>,
        reply: Reply<()>,
    },
}

impl EngineCommand {
    /// The state machine event this command attempts, if any.
    pub fn event(&self) -> Option<EngineEvent> {
        match self {
            EngineCommand::Start { .. } => Some(EngineEvent::Start),
            EngineCommand::Terminate { .. } => Some(EngineEvent::Terminate),
            EngineCommand::ForceKill { .. } => Some(EngineEvent::ForceKill),
            EngineCommand::Configure { .. } => None,
        }
    }
}

/// Cloneable front door to the engine controller.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    pub fn new(commands: mpsc::Sender<EngineCommand>) -> Self {
        Self { commands }
    }

    pub async fn start(&self) -> Result<(), EngineError> {
        self.request(|reply| EngineCommand::Start { reply }).await
    }

    pub async fn terminate(&self) -> Result<(), EngineError> {
        self.request(|reply| EngineCommand::Terminate { reply }).await
    }

    pub async fn force_kill(&self) -> Result<KillOutput, EngineError> {
        self.request(|reply| EngineCommand::ForceKill { reply }).await
    }

    pub async fn configure(&self, config: EngineConfig) -> Result<(), EngineError> {
        self.request(|reply| EngineCommand::Configure {
            config: Box::new(config),
            reply,
        })
        .await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> EngineCommand,
    ) -> Result<T, EngineError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| EngineError::ControllerStopped)?;
        response.await.map_err(|_| EngineError::ControllerStopped)?
    }
}
