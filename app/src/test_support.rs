//! Scripted collaborators for unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use url::Url;

use crate::clients::{ClientError, RemoteCheckpoint, RemoteEngineClient};

#[derive(Default)]
struct MockState {
    checkpoints: Vec<RemoteCheckpoint>,
    loaded: Option<String>,
    list_error: Option<ClientError>,
    set_errors: HashMap<String, ClientError>,
    /// Titles whose set call blocks until released
    gates: HashMap<String, Arc<Semaphore>>,
    /// When false, set calls succeed but the engine keeps reporting the old title
    applies_loads: bool,
    set_calls: Vec<String>,
    refresh_calls: usize,
    list_calls: usize,
}

/// An in-memory engine. Setting a checkpoint changes what
/// `loaded_checkpoint` reports once the call completes.
#[derive(Clone)]
pub struct MockEngineClient {
    state: Arc<Mutex<MockState>>,
}

impl MockEngineClient {
    pub fn new(checkpoints: Vec<RemoteCheckpoint>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                checkpoints,
                applies_loads: true,
                ..Default::default()
            })),
        }
    }

    pub fn set_checkpoints(&self, checkpoints: Vec<RemoteCheckpoint>) {
        self.state.lock().unwrap().checkpoints = checkpoints;
    }

    pub fn set_loaded(&self, title: Option<&str>) {
        self.state.lock().unwrap().loaded = title.map(str::to_string);
    }

    pub fn fail_list(&self, error: ClientError) {
        self.state.lock().unwrap().list_error = Some(error);
    }

    pub fn fail_set(&self, title: &str, error: ClientError) {
        self.state
            .lock()
            .unwrap()
            .set_errors
            .insert(title.to_string(), error);
    }

    pub fn ignore_loads(&self) {
        self.state.lock().unwrap().applies_loads = false;
    }

    /// Makes set calls for `title` wait until [`release`](Self::release).
    pub fn gate(&self, title: &str) {
        self.state
            .lock()
            .unwrap()
            .gates
            .insert(title.to_string(), Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, title: &str) {
        if let Some(gate) = self.state.lock().unwrap().gates.get(title) {
            gate.add_permits(1);
        }
    }

    pub fn set_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().set_calls.clone()
    }

    pub fn refresh_calls(&self) -> usize {
        self.state.lock().unwrap().refresh_calls
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().unwrap().list_calls
    }

    /// Waits until `count` set calls have been issued.
    pub async fn wait_for_set_calls(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.set_calls().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("set calls were not issued");
    }
}

#[async_trait]
impl RemoteEngineClient for MockEngineClient {
    async fn refresh_checkpoints(&self, _base: &Url) -> Result<(), ClientError> {
        self.state.lock().unwrap().refresh_calls += 1;
        Ok(())
    }

    async fn list_checkpoints(&self, _base: &Url) -> Result<Vec<RemoteCheckpoint>, ClientError> {
        let mut state = self.state.lock().unwrap();
        state.list_calls += 1;
        match &state.list_error {
            Some(error) => Err(error.clone()),
            None => Ok(state.checkpoints.clone()),
        }
    }

    async fn loaded_checkpoint(&self, _base: &Url) -> Result<Option<String>, ClientError> {
        Ok(self.state.lock().unwrap().loaded.clone())
    }

    async fn set_loaded_checkpoint(&self, _base: &Url, title: &str) -> Result<(), ClientError> {
        let gate = {
            let mut state = self.state.lock().unwrap();
            state.set_calls.push(title.to_string());
            state.gates.get(title).cloned()
        };
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }

        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.set_errors.get(title) {
            return Err(error.clone());
        }
        if state.applies_loads {
            state.loaded = Some(title.to_string());
        }
        Ok(())
    }
}

pub fn remote_checkpoint(filename: &str, title: &str) -> RemoteCheckpoint {
    RemoteCheckpoint {
        title: title.to_string(),
        model_name: filename
            .rsplit('/')
            .next()
            .unwrap_or(filename)
            .rsplit_once('.')
            .map(|(stem, _)| stem.to_string())
            .unwrap_or_else(|| filename.to_string()),
        hash: None,
        sha256: None,
        filename: filename.to_string(),
        config: None,
    }
}
