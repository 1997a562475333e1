use std::fs;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, info};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::parser::{UrlPattern, DEFAULT_URL_PATTERNS};

/// Type-safe configuration key that associates a key name with its value type
#[derive(Debug, Clone, Copy)]
pub struct ConfigKey<T> {
    name: &'static str,
    _phantom: PhantomData<T>,
}

impl<T> ConfigKey<T> {
    const fn new(name: &'static str) -> Self {
        Self {
            name,
            _phantom: PhantomData,
        }
    }

    pub fn key_name(&self) -> &'static str {
        self.name
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to access config file: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to (de)serialize config: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Config file {0:?} does not contain a JSON object")]
    NotAnObject(PathBuf),
}

// ===== Engine Configuration =====

/// How the engine announces its endpoint; see [`UrlPattern`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceUrlPattern {
    pub regex: String,
    pub required_substring: String,
}

fn default_process_class() -> String {
    "launch.py".to_string()
}

fn default_terminate_timeout_ms() -> u64 {
    10_000
}

fn default_service_url_patterns() -> Vec<ServiceUrlPattern> {
    DEFAULT_URL_PATTERNS
        .iter()
        .map(|(regex, required)| ServiceUrlPattern {
            regex: regex.to_string(),
            required_substring: required.to_string(),
        })
        .collect()
}

/// Engine launch configuration (stored locally)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Launch script, e.g. `/opt/stable-diffusion-webui/webui.sh`
    #[serde(default)]
    pub script_path: Option<PathBuf>,
    /// Directory the engine loads checkpoints from; also the watched directory
    #[serde(default)]
    pub model_directory: Option<PathBuf>,
    /// Passed to the script after the built-in arguments
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Command-line fragment identifying engine processes for forced recovery
    #[serde(default = "default_process_class")]
    pub process_class: String,
    /// Grace period before terminate falls back to forced recovery
    #[serde(default = "default_terminate_timeout_ms")]
    pub terminate_timeout_ms: u64,
    #[serde(default = "default_service_url_patterns")]
    pub service_url_patterns: Vec<ServiceUrlPattern>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            script_path: None,
            model_directory: None,
            extra_args: Vec::new(),
            process_class: default_process_class(),
            terminate_timeout_ms: default_terminate_timeout_ms(),
            service_url_patterns: default_service_url_patterns(),
        }
    }
}

impl ConfigKey<EngineConfig> {
    pub const ENGINE: Self = Self::new("engineConfig");
}

/// Launch inputs that are missing or do not point at anything usable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LaunchInputError {
    #[error("No launch script configured")]
    ScriptPathNotSet,
    #[error("Launch script not found: {}", .0.display())]
    ScriptNotFound(PathBuf),
    #[error("No model directory configured")]
    ModelDirectoryNotSet,
    #[error("Model directory not found: {}", .0.display())]
    ModelDirectoryNotFound(PathBuf),
}

/// Everything the supervisor needs to spawn the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchTarget {
    pub working_directory: PathBuf,
    pub executable: String,
    pub args: Vec<String>,
}

impl EngineConfig {
    pub fn launch_target(&self) -> Result<LaunchTarget, LaunchInputError> {
        let script = self
            .script_path
            .as_ref()
            .ok_or(LaunchInputError::ScriptPathNotSet)?;
        if !script.is_file() {
            return Err(LaunchInputError::ScriptNotFound(script.clone()));
        }
        let (Some(working_directory), Some(file_name)) = (script.parent(), script.file_name())
        else {
            return Err(LaunchInputError::ScriptNotFound(script.clone()));
        };

        let models = self
            .model_directory
            .as_ref()
            .ok_or(LaunchInputError::ModelDirectoryNotSet)?;
        if !models.is_dir() {
            return Err(LaunchInputError::ModelDirectoryNotFound(models.clone()));
        }

        let mut args = vec![
            "--api".to_string(),
            "--ckpt-dir".to_string(),
            models.to_string_lossy().into_owned(),
        ];
        args.extend(self.extra_args.iter().cloned());

        Ok(LaunchTarget {
            working_directory: working_directory.to_path_buf(),
            executable: format!("./{}", file_name.to_string_lossy()),
            args,
        })
    }

    pub fn url_patterns(&self) -> Vec<UrlPattern> {
        UrlPattern::compile_all(
            self.service_url_patterns
                .iter()
                .map(|p| (p.regex.as_str(), p.required_substring.as_str())),
        )
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }
}

// ===== Sync Configuration =====

/// Timing of remote reconciliation and checkpoint loads (stored locally)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Timeout for list/refresh/options calls
    pub request_timeout_secs: u64,
    /// Timeout for the set-checkpoint call; the engine loads synchronously
    pub load_timeout_secs: u64,
    /// Window in which directory changes are coalesced
    pub debounce_ms: u64,
    pub confirm_attempts: u32,
    pub confirm_interval_ms: u64,
    /// 0 disables periodic reconciliation
    pub periodic_reconcile_secs: u64,
    pub watch_poll_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            load_timeout_secs: 600,
            debounce_ms: 300,
            confirm_attempts: 10,
            confirm_interval_ms: 1000,
            periodic_reconcile_secs: 0,
            watch_poll_ms: 1500,
        }
    }
}

impl SyncConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn confirm_interval(&self) -> Duration {
        Duration::from_millis(self.confirm_interval_ms)
    }

    pub fn periodic_reconcile(&self) -> Option<Duration> {
        (self.periodic_reconcile_secs > 0).then(|| Duration::from_secs(self.periodic_reconcile_secs))
    }

    pub fn watch_poll(&self) -> Duration {
        Duration::from_millis(self.watch_poll_ms)
    }
}

impl ConfigKey<SyncConfig> {
    pub const SYNC: Self = Self::new("syncConfig");
}

// ===== Checkpoint Selection =====

/// Last checkpoint the user picked; re-requested when the engine comes up
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointSelection {
    pub selected_checkpoint: Option<PathBuf>,
}

impl ConfigKey<CheckpointSelection> {
    pub const SELECTION: Self = Self::new("checkpointSelection");
}

/// All stored configuration, with defaults for anything missing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub sync: SyncConfig,
    pub selection: CheckpointSelection,
}

impl AppConfig {
    pub fn load(store: &impl ConfigStore) -> Self {
        Self {
            engine: store.get(&ConfigKey::ENGINE).unwrap_or_default(),
            sync: store.get(&ConfigKey::SYNC).unwrap_or_default(),
            selection: store.get(&ConfigKey::SELECTION).unwrap_or_default(),
        }
    }
}

// ===== Type-Safe Config Store =====

pub trait ConfigStore {
    fn get<T: DeserializeOwned>(&self, key: &ConfigKey<T>) -> Option<T>;
    fn set<T: Serialize>(&self, key: &ConfigKey<T>, value: T) -> Result<(), ConfigError>;
    fn delete<T>(&self, key: &ConfigKey<T>) -> Result<(), ConfigError>;
}

#[derive(Debug)]
struct ConfigFile {
    path: Option<PathBuf>,
    values: Map<String, Value>,
}

/// Type-safe configuration store backed by a JSON object file.
///
/// Every change is written through immediately. `in_memory` stores nothing
/// on disk.
#[derive(Debug, Clone)]
pub struct Config {
    file: Arc<Mutex<ConfigFile>>,
}

impl Config {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let values = match fs::read(&path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Map::new(),
            Ok(bytes) => match serde_json::from_slice::<Value>(&bytes)? {
                Value::Object(values) => values,
                _ => return Err(ConfigError::NotAnObject(path)),
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("No config file at {:?}, starting with defaults", path);
                Map::new()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            file: Arc::new(Mutex::new(ConfigFile {
                path: Some(path),
                values,
            })),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            file: Arc::new(Mutex::new(ConfigFile {
                path: None,
                values: Map::new(),
            })),
        }
    }

    fn with_file<R>(&self, f: impl FnOnce(&mut ConfigFile) -> R) -> R {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut file)
    }
}

fn save(file: &ConfigFile) -> Result<(), ConfigError> {
    let Some(path) = &file.path else {
        return Ok(());
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec_pretty(&file.values)?;
    write_atomic(path, &json)?;
    debug!("Saved config to {:?}", path);
    Ok(())
}

/// Writes to a sibling temp file and renames it over `path`.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}

impl ConfigStore for Config {
    fn get<T: DeserializeOwned>(&self, key: &ConfigKey<T>) -> Option<T> {
        self.with_file(|file| {
            file.values
                .get(key.key_name())
                .and_then(|v| serde_json::from_value(v.clone()).ok())
        })
    }

    fn set<T: Serialize>(&self, key: &ConfigKey<T>, value: T) -> Result<(), ConfigError> {
        let val = serde_json::to_value(value)?;
        self.with_file(|file| {
            file.values.insert(key.key_name().to_string(), val);
            save(file)
        })
    }

    fn delete<T>(&self, key: &ConfigKey<T>) -> Result<(), ConfigError> {
        self.with_file(|file| {
            file.values.remove(key.key_name());
            save(file)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use tempfile::TempDir;

    // Simple in-memory mock store for testing
    struct MockConfigStore {
        data: RefCell<HashMap<String, serde_json::Value>>,
    }

    impl MockConfigStore {
        fn new() -> Self {
            Self {
                data: RefCell::new(HashMap::new()),
            }
        }
    }

    impl ConfigStore for MockConfigStore {
        fn get<T: DeserializeOwned>(&self, key: &ConfigKey<T>) -> Option<T> {
            self.data
                .borrow()
                .get(key.key_name())
                .and_then(|v| serde_json::from_value(v.clone()).ok())
        }

        fn set<T: Serialize>(&self, key: &ConfigKey<T>, value: T) -> Result<(), ConfigError> {
            let val = serde_json::to_value(value)?;
            self.data
                .borrow_mut()
                .insert(key.key_name().to_string(), val);
            Ok(())
        }

        fn delete<T>(&self, key: &ConfigKey<T>) -> Result<(), ConfigError> {
            self.data.borrow_mut().remove(key.key_name());
            Ok(())
        }
    }

    #[test]
    fn test_engine_config_store() {
        let test_cases = vec![
            (
                "EngineConfig with all fields set",
                ConfigKey::ENGINE,
                EngineConfig {
                    script_path: Some(PathBuf::from("/opt/webui/webui.sh")),
                    model_directory: Some(PathBuf::from("/data/models")),
                    extra_args: vec!["--xformers".to_string()],
                    process_class: "launch.py".to_string(),
                    terminate_timeout_ms: 5000,
                    service_url_patterns: default_service_url_patterns(),
                },
            ),
            ("EngineConfig with defaults", ConfigKey::ENGINE, EngineConfig::default()),
        ];

        for (description, key, config) in test_cases {
            let store = MockConfigStore::new();
            test_config_lifecycle(&store, &key, config, description);
        }
    }

    #[test]
    fn test_sync_config_store() {
        let test_cases = vec![
            ("SyncConfig with defaults", ConfigKey::SYNC, SyncConfig::default()),
            (
                "SyncConfig with periodic reconcile",
                ConfigKey::SYNC,
                SyncConfig {
                    periodic_reconcile_secs: 60,
                    ..SyncConfig::default()
                },
            ),
        ];

        for (description, key, config) in test_cases {
            let store = MockConfigStore::new();
            test_config_lifecycle(&store, &key, config, description);
        }
    }

    #[test]
    fn test_selection_config_store() {
        let test_cases = vec![
            (
                "CheckpointSelection with checkpoint",
                ConfigKey::SELECTION,
                CheckpointSelection {
                    selected_checkpoint: Some(PathBuf::from("/data/models/a.safetensors")),
                },
            ),
            (
                "CheckpointSelection empty",
                ConfigKey::SELECTION,
                CheckpointSelection::default(),
            ),
        ];

        for (description, key, config) in test_cases {
            let store = MockConfigStore::new();
            test_config_lifecycle(&store, &key, config, description);
        }
    }

    #[test]
    fn test_partial_sync_config_uses_defaults() {
        let config: SyncConfig = serde_json::from_str(r#"{"debounceMs": 50}"#).unwrap();
        assert_eq!(config.debounce_ms, 50);
        assert_eq!(config.confirm_attempts, 10);
        assert!(config.periodic_reconcile().is_none());
    }

    #[test]
    fn test_launch_target_guards() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("webui.sh");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        let models = dir.path().join("models");
        fs::create_dir(&models).unwrap();

        let test_cases = vec![
            ("no script", None, Some(models.clone()), LaunchInputError::ScriptPathNotSet),
            (
                "missing script",
                Some(dir.path().join("nope.sh")),
                Some(models.clone()),
                LaunchInputError::ScriptNotFound(dir.path().join("nope.sh")),
            ),
            ("no models", Some(script.clone()), None, LaunchInputError::ModelDirectoryNotSet),
            (
                "missing models",
                Some(script.clone()),
                Some(dir.path().join("gone")),
                LaunchInputError::ModelDirectoryNotFound(dir.path().join("gone")),
            ),
        ];

        for (description, script_path, model_directory, expected) in test_cases {
            let config = EngineConfig {
                script_path,
                model_directory,
                ..EngineConfig::default()
            };
            assert_eq!(config.launch_target().unwrap_err(), expected, "{}", description);
        }
    }

    #[test]
    fn test_launch_target() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("webui.sh");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        let config = EngineConfig {
            script_path: Some(script),
            model_directory: Some(dir.path().to_path_buf()),
            extra_args: vec!["--listen".to_string()],
            ..EngineConfig::default()
        };

        let target = config.launch_target().unwrap();
        assert_eq!(target.working_directory, dir.path());
        assert_eq!(target.executable, "./webui.sh");
        assert_eq!(target.args[0], "--api");
        assert_eq!(target.args[2], dir.path().to_string_lossy());
        assert_eq!(target.args.last().unwrap(), "--listen");
    }

    #[test]
    fn test_file_store_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let store = Config::open(&path).unwrap();
        assert!(store.get(&ConfigKey::SELECTION).is_none());
        store
            .set(
                &ConfigKey::SELECTION,
                CheckpointSelection {
                    selected_checkpoint: Some(PathBuf::from("/m/a.ckpt")),
                },
            )
            .unwrap();

        let reopened = Config::open(&path).unwrap();
        let app = AppConfig::load(&reopened);
        assert_eq!(
            app.selection.selected_checkpoint,
            Some(PathBuf::from("/m/a.ckpt"))
        );
        assert_eq!(app.sync, SyncConfig::default());

        reopened.delete(&ConfigKey::SELECTION).unwrap();
        assert!(Config::open(&path).unwrap().get(&ConfigKey::SELECTION).is_none());
    }

    #[test]
    fn test_file_store_rejects_non_object() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "[1, 2]").unwrap();
        assert!(matches!(Config::open(&path), Err(ConfigError::NotAnObject(_))));
    }

    // Helper function to check if a string is in camelCase format
    fn is_camel_case(s: &str) -> bool {
        let mut chars = s.chars();
        match chars.next() {
            Some(first) if first.is_ascii_lowercase() => chars.all(|c| c.is_alphanumeric()),
            _ => false,
        }
    }

    // Helper function to verify camelCase format dynamically
    fn verify_camel_case<T>(store: &MockConfigStore, key: &ConfigKey<T>) {
        assert!(
            is_camel_case(key.key_name()),
            "Config key '{}' should be camelCase",
            key.key_name()
        );

        let stored_json = store.data.borrow().get(key.key_name()).cloned();
        if let Some(obj) = stored_json.as_ref().and_then(|v| v.as_object()) {
            for field_key in obj.keys() {
                assert!(
                    is_camel_case(field_key),
                    "Field '{}' in {} should be camelCase",
                    field_key,
                    key.key_name()
                );
            }
        }
    }

    // Helper function to test the full lifecycle of a config
    fn test_config_lifecycle<T>(
        store: &MockConfigStore,
        key: &ConfigKey<T>,
        test_config: T,
        description: &str,
    ) where
        T: Serialize + DeserializeOwned + PartialEq + std::fmt::Debug + Clone,
    {
        let result: Option<T> = store.get(key);
        assert!(result.is_none(), "{}: Get should return None before set", description);

        store
            .set(key, test_config.clone())
            .unwrap_or_else(|e| panic!("{}: Set should succeed: {}", description, e));

        let retrieved = store.get(key);
        assert_eq!(retrieved, Some(test_config), "{}: Retrieved config should match", description);

        verify_camel_case(store, key);

        store
            .delete(key)
            .unwrap_or_else(|e| panic!("{}: Delete should succeed: {}", description, e));
        let result: Option<T> = store.get(key);
        assert!(result.is_none(), "{}: Get should return None after delete", description);
    }
}
