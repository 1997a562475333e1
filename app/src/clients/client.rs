use async_trait::async_trait;
use url::Url;

use super::endpoints::RemoteCheckpoint;
use super::error::ClientError;

/// The engine's REST API as the checkpoint sync engine uses it.
///
/// Every call takes the base URL discovered at launch, so one client serves
/// every run of the engine.
#[async_trait]
pub trait RemoteEngineClient: Send + Sync {
    /// Asks the engine to re-read its checkpoint directory
    async fn refresh_checkpoints(&self, base: &Url) -> Result<(), ClientError>;

    async fn list_checkpoints(&self, base: &Url) -> Result<Vec<RemoteCheckpoint>, ClientError>;

    /// Title of the checkpoint the engine has loaded, if it reports one
    async fn loaded_checkpoint(&self, base: &Url) -> Result<Option<String>, ClientError>;

    /// Asks the engine to load the checkpoint with this title.
    /// A rejected title comes back as [`ClientError::Validation`].
    async fn set_loaded_checkpoint(&self, base: &Url, title: &str) -> Result<(), ClientError>;
}
