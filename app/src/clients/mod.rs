mod client;
mod config;
mod endpoints;
mod engine_client;
mod error;

// Re-export public types
pub use client::RemoteEngineClient;
pub use config::{ApiCredentials, ClientConfig, API_AUTH_ENV};
pub use endpoints::{
    describe_validation, EndpointRecord, EngineOptions, RemoteCheckpoint, RemoteSampler,
};
pub use engine_client::HttpEngineClient;
pub use error::ClientError;
