use async_trait::async_trait;
use url::Url;

use crate::config::EngineConfig;

/// Notified by the engine controller about reachability changes.
///
/// The async callbacks run on their own task so a slow observer never stalls
/// output draining. `engine_reconfigured` runs inline and must not block.
#[async_trait]
pub trait EngineObserver: Send + Sync {
    /// The engine entered Active at `url`.
    async fn engine_activated(&self, url: &Url);

    /// The engine left Active or Launching.
    async fn engine_stopped(&self) {}

    /// The launch configuration was replaced. Called before `configure`
    /// returns.
    fn engine_reconfigured(&self, _config: &EngineConfig) {}
}
