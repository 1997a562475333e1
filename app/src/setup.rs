use std::path::PathBuf;
use std::sync::Arc;

use easel_process::ProcessSupervisor;
use log::{info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::checkpoints::{CheckpointRecord, CheckpointSyncEngine, PollingWatcher};
use crate::clients::{ApiCredentials, ClientConfig, HttpEngineClient, RemoteEngineClient};
use crate::config::{AppConfig, CheckpointSelection, Config, ConfigKey, ConfigStore};
use crate::engine::{EngineCommand, EngineController, EngineHandle};
use crate::error::Error;
use crate::events::EventBus;
use crate::persistence::{JsonRecordStore, MemoryRecordStore, RecordStore};
use crate::state::SharedState;

/// Where configuration lives and what the command line overrides.
#[derive(Debug, Clone, Default)]
pub struct CoreOptions {
    /// JSON config file; `None` keeps everything in memory
    pub config_path: Option<PathBuf>,
    /// Cache of engine metadata for local checkpoints
    pub cache_path: Option<PathBuf>,
    pub script_path: Option<PathBuf>,
    pub model_directory: Option<PathBuf>,
    /// Stored as the selection, so it is loaded once the engine is Active
    pub checkpoint: Option<PathBuf>,
}

/// Everything the application talks to, wired together.
pub struct Core {
    pub engine: EngineHandle,
    pub sync: Arc<CheckpointSyncEngine>,
    pub state: SharedState,
    pub config: Config,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Core {
    pub fn bus(&self) -> &EventBus {
        self.state.bus()
    }

    /// Stops watching, stops the engine (forcing it if needed) and waits for
    /// the background tasks.
    pub async fn shutdown(self) {
        info!("Shutting down");
        self.sync.unwatch();
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
    }
}

/// Builds the core. Must run inside a tokio runtime.
pub async fn setup_core(options: CoreOptions) -> Result<Core, Error> {
    info!("Easel v{}", env!("CARGO_PKG_VERSION"));

    let config = match &options.config_path {
        Some(path) => Config::open(path)?,
        None => Config::in_memory(),
    };
    apply_overrides(&config, &options)?;
    let app_config = AppConfig::load(&config);

    let bus = EventBus::new();
    let state = SharedState::new(bus);
    let shutdown = CancellationToken::new();

    let client_config = ClientConfig {
        request_timeout: app_config.sync.request_timeout(),
        load_timeout: app_config.sync.load_timeout(),
        credentials: ApiCredentials::from_env(),
    };
    if client_config.credentials.is_some() {
        info!("Using API credentials from the environment");
    }
    let client: Arc<dyn RemoteEngineClient> = Arc::new(HttpEngineClient::new(client_config)?);

    let records: Arc<dyn RecordStore<CheckpointRecord>> = match &options.cache_path {
        Some(path) => Arc::new(JsonRecordStore::new(path)),
        None => Arc::new(MemoryRecordStore::new()),
    };

    let sync = Arc::new(CheckpointSyncEngine::new(
        state.clone(),
        client,
        app_config.engine.model_directory.clone().unwrap_or_default(),
        app_config.sync.clone(),
        records,
        config.clone(),
    ));
    sync.rescan_local_directory().await;
    sync.restore_cached_records();

    // ========================================
    // CHANNEL-BASED ARCHITECTURE WITH CONTROLLER
    // Commands flow through a channel to the controller, which owns the process
    // ========================================
    let (command_tx, command_rx) = mpsc::channel::<EngineCommand>(100);
    let (supervisor, process_rx) = ProcessSupervisor::new();
    let mut controller = EngineController::new(
        command_rx,
        supervisor,
        process_rx,
        state.clone(),
        app_config.engine.clone(),
        shutdown.child_token(),
    );
    controller.add_observer(sync.clone());

    let mut tasks = vec![tokio::spawn(controller.run())];

    let changes = sync.attach_watcher(Arc::new(PollingWatcher::new(
        app_config.sync.watch_poll(),
    )))?;
    tasks.push(tokio::spawn(
        sync.clone().run_watch_loop(changes, shutdown.child_token()),
    ));

    Ok(Core {
        engine: EngineHandle::new(command_tx),
        sync,
        state,
        config,
        shutdown,
        tasks,
    })
}

/// Persists command-line overrides so later runs keep them.
fn apply_overrides(config: &Config, options: &CoreOptions) -> Result<(), Error> {
    if options.script_path.is_some() || options.model_directory.is_some() {
        let mut engine = config.get(&ConfigKey::ENGINE).unwrap_or_default();
        if let Some(script) = &options.script_path {
            engine.script_path = Some(script.clone());
        }
        if let Some(dir) = &options.model_directory {
            engine.model_directory = Some(dir.clone());
        }
        config.set(&ConfigKey::ENGINE, engine)?;
    }

    if let Some(checkpoint) = &options.checkpoint {
        config.set(
            &ConfigKey::SELECTION,
            CheckpointSelection {
                selected_checkpoint: Some(checkpoint.clone()),
            },
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineState;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_setup_scans_models_and_persists_overrides() {
        let dir = TempDir::new().unwrap();
        let models = dir.path().join("models");
        std::fs::create_dir_all(&models).unwrap();
        std::fs::write(models.join("a.safetensors"), b"").unwrap();
        let config_path = dir.path().join("easel.json");

        let core = setup_core(CoreOptions {
            config_path: Some(config_path.clone()),
            model_directory: Some(models.clone()),
            ..Default::default()
        })
        .await
        .unwrap();

        assert_eq!(core.state.engine(), EngineState::Idle);
        assert_eq!(core.state.inventory().len(), 1);
        core.shutdown().await;

        let reopened = Config::open(&config_path).unwrap();
        let engine = reopened.get(&ConfigKey::ENGINE).unwrap();
        assert_eq!(engine.model_directory, Some(models));
    }

    #[tokio::test]
    async fn test_reconfigured_model_directory_is_scanned() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("old");
        let new = dir.path().join("new");
        std::fs::create_dir_all(&old).unwrap();
        std::fs::create_dir_all(&new).unwrap();
        std::fs::write(new.join("n.safetensors"), b"").unwrap();

        let core = setup_core(CoreOptions {
            model_directory: Some(old.clone()),
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(core.state.inventory().len(), 0);

        let mut engine = AppConfig::load(&core.config).engine;
        engine.model_directory = Some(new.clone());
        core.engine.configure(engine).await.unwrap();

        assert_eq!(core.sync.model_directory(), new);
        core.sync.rescan_local_directory().await;
        let paths: Vec<PathBuf> = core
            .state
            .inventory()
            .records()
            .map(|record| record.path.clone())
            .collect();
        assert_eq!(paths, vec![new.join("n.safetensors")]);
        core.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_without_script_is_unable_to_locate() {
        let core = setup_core(CoreOptions::default()).await.unwrap();

        let result = core.engine.start().await;
        assert!(result.is_err());
        assert!(matches!(core.state.engine(), EngineState::UnableToLocate(_)));
        core.shutdown().await;
    }
}
