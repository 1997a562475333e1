use derive_more::{Display, From};

#[derive(Debug, From, Display)]
pub enum Error {
    #[from]
    #[display("Configuration error: {_0}")]
    Config(crate::config::ConfigError),

    #[from]
    #[display("Engine client error: {_0}")]
    Client(crate::clients::ClientError),

    #[from]
    #[display("{_0}")]
    Engine(crate::engine::EngineError),

    #[from]
    #[display("Checkpoint sync error: {_0}")]
    Sync(crate::checkpoints::SyncError),

    #[from]
    #[display("Checkpoint load error: {_0}")]
    Load(crate::checkpoints::LoadError),

    #[from]
    #[display("Directory watch error: {_0}")]
    Watch(crate::checkpoints::WatchError),
}

impl std::error::Error for Error {}
