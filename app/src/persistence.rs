//! Record persistence behind a `save_all` / `fetch(predicate)` contract.

use std::fs;
use std::io;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::{write_atomic, ConfigError};

pub trait RecordStore<T>: Send + Sync {
    /// Replaces every stored record.
    fn save_all(&self, records: &[T]) -> Result<(), ConfigError>;
    fn fetch(&self, predicate: &dyn Fn(&T) -> bool) -> Result<Vec<T>, ConfigError>;
}

/// Stores records as a JSON array in one file.
#[derive(Debug)]
pub struct JsonRecordStore<T> {
    path: PathBuf,
    lock: Mutex<()>,
    _record: PhantomData<fn() -> T>,
}

impl<T> JsonRecordStore<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
            _record: PhantomData,
        }
    }
}

impl<T> RecordStore<T> for JsonRecordStore<T>
where
    T: Serialize + DeserializeOwned,
{
    fn save_all(&self, records: &[T]) -> Result<(), ConfigError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(records)?;
        write_atomic(&self.path, &json)?;
        debug!("Saved {} records to {:?}", records.len(), self.path);
        Ok(())
    }

    fn fetch(&self, predicate: &dyn Fn(&T) -> bool) -> Result<Vec<T>, ConfigError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let records: Vec<T> = serde_json::from_slice(&bytes).map_err(|e| {
            warn!("Record cache {:?} is unreadable: {}", self.path, e);
            e
        })?;
        Ok(records.into_iter().filter(|r| predicate(r)).collect())
    }
}

/// Keeps records in memory only.
#[derive(Debug, Default)]
pub struct MemoryRecordStore<T> {
    records: Mutex<Vec<T>>,
}

impl<T> MemoryRecordStore<T> {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }
}

impl<T> RecordStore<T> for MemoryRecordStore<T>
where
    T: Clone + Send,
{
    fn save_all(&self, records: &[T]) -> Result<(), ConfigError> {
        *self.records.lock().unwrap_or_else(PoisonError::into_inner) = records.to_vec();
        Ok(())
    }

    fn fetch(&self, predicate: &dyn Fn(&T) -> bool) -> Result<Vec<T>, ConfigError> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| predicate(r))
            .cloned()
            .collect())
    }
}
