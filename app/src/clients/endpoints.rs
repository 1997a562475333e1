//! Wire shapes for the engine's REST API.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A record type the engine exposes as a list endpoint.
pub trait EndpointRecord: DeserializeOwned + Send + 'static {
    /// GET path returning a JSON array of records
    const FETCH_PATH: &'static str;
    /// POST path asking the engine to re-read its records from disk
    const REFRESH_PATH: Option<&'static str> = None;
}

pub const OPTIONS_PATH: &str = "/sdapi/v1/options";

/// A checkpoint as the engine reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCheckpoint {
    /// Name plus hash suffix, e.g. `v1-5-pruned.safetensors [6ce0161689]`
    pub title: String,
    pub model_name: String,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
    /// Absolute path on the engine's side
    pub filename: String,
    #[serde(default)]
    pub config: Option<String>,
}

impl EndpointRecord for RemoteCheckpoint {
    const FETCH_PATH: &'static str = "/sdapi/v1/sd-models";
    const REFRESH_PATH: Option<&'static str> = Some("/sdapi/v1/refresh-checkpoints");
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSampler {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl EndpointRecord for RemoteSampler {
    const FETCH_PATH: &'static str = "/sdapi/v1/samplers";
}

/// The subset of `/sdapi/v1/options` this crate reads and writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sd_model_checkpoint: Option<String>,
}

/// Body of a 422 response.
#[derive(Debug, Clone, Deserialize)]
pub struct ValidationErrorBody {
    pub detail: ValidationDetail,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ValidationDetail {
    Items(Vec<ValidationItem>),
    Message(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidationItem {
    pub msg: String,
    #[serde(default)]
    pub loc: Vec<serde_json::Value>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

impl ValidationErrorBody {
    /// Human-readable summary, one `location: message` entry per item.
    pub fn describe(&self) -> String {
        match &self.detail {
            ValidationDetail::Message(message) => message.clone(),
            ValidationDetail::Items(items) => items
                .iter()
                .map(|item| {
                    let loc: Vec<String> = item
                        .loc
                        .iter()
                        .map(|part| match part {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .collect();
                    if loc.is_empty() {
                        item.msg.clone()
                    } else {
                        format!("{}: {}", loc.join("."), item.msg)
                    }
                })
                .collect::<Vec<_>>()
                .join("; "),
        }
    }
}

/// Reads a 422 body, falling back to the raw text when it has another shape.
pub fn describe_validation(body: &str) -> String {
    match serde_json::from_str::<ValidationErrorBody>(body) {
        Ok(parsed) => parsed.describe(),
        Err(_) if body.trim().is_empty() => "The engine rejected the request".to_string(),
        Err(_) => body.trim().to_string(),
    }
}
