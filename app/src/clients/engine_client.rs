//! reqwest implementation of [`RemoteEngineClient`].

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{RequestBuilder, Response, StatusCode};
use secrecy::ExposeSecret;
use url::Url;

use super::client::RemoteEngineClient;
use super::config::ClientConfig;
use super::endpoints::{
    describe_validation, EndpointRecord, EngineOptions, RemoteCheckpoint, RemoteSampler,
    OPTIONS_PATH,
};
use super::error::ClientError;

/// HTTP client for the engine's `/sdapi/v1` API.
#[derive(Debug, Clone)]
pub struct HttpEngineClient {
    http: reqwest::Client,
    config: ClientConfig,
}

impl HttpEngineClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(Self { http, config })
    }

    /// Fetches every record of `R` from its list endpoint.
    pub async fn fetch_records<R: EndpointRecord>(&self, base: &Url) -> Result<Vec<R>, ClientError> {
        let request = self.http.get(endpoint(base, R::FETCH_PATH));
        let response = self.send(request).await?;
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| {
            warn!("Malformed response from {}: {}", R::FETCH_PATH, e);
            ClientError::Decode(e.to_string())
        })
    }

    /// Asks the engine to re-read records of `R`. A no-op for record types
    /// without a refresh endpoint.
    pub async fn refresh_records<R: EndpointRecord>(&self, base: &Url) -> Result<(), ClientError> {
        let Some(path) = R::REFRESH_PATH else {
            return Ok(());
        };
        self.send(self.http.post(endpoint(base, path))).await?;
        Ok(())
    }

    pub async fn list_samplers(&self, base: &Url) -> Result<Vec<RemoteSampler>, ClientError> {
        self.fetch_records::<RemoteSampler>(base).await
    }

    pub async fn options(&self, base: &Url) -> Result<EngineOptions, ClientError> {
        let response = self.send(self.http.get(endpoint(base, OPTIONS_PATH))).await?;
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| ClientError::Decode(e.to_string()))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.credentials {
            Some(creds) => {
                request.basic_auth(&creds.username, Some(creds.password.expose_secret()))
            }
            None => request,
        }
    }

    /// Sends the request and turns every non-success status into an error.
    async fn send(&self, request: RequestBuilder) -> Result<Response, ClientError> {
        let response = self.authorize(request).send().await?;
        let status = response.status();
        debug!("Engine responded {} for {}", status, response.url().path());
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        if status == StatusCode::UNPROCESSABLE_ENTITY {
            return Err(ClientError::Validation(describe_validation(&body)));
        }
        Err(ClientError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

/// Joins an API path onto the base, keeping any path prefix the engine was
/// mounted under.
fn endpoint(base: &Url, path: &str) -> String {
    format!("{}{}", base.as_str().trim_end_matches('/'), path)
}

#[async_trait]
impl RemoteEngineClient for HttpEngineClient {
    async fn refresh_checkpoints(&self, base: &Url) -> Result<(), ClientError> {
        self.refresh_records::<RemoteCheckpoint>(base).await
    }

    async fn list_checkpoints(&self, base: &Url) -> Result<Vec<RemoteCheckpoint>, ClientError> {
        self.fetch_records::<RemoteCheckpoint>(base).await
    }

    async fn loaded_checkpoint(&self, base: &Url) -> Result<Option<String>, ClientError> {
        let options = self.options(base).await?;
        Ok(options.sd_model_checkpoint.filter(|title| !title.is_empty()))
    }

    async fn set_loaded_checkpoint(&self, base: &Url, title: &str) -> Result<(), ClientError> {
        let body = EngineOptions {
            sd_model_checkpoint: Some(title.to_string()),
        };
        let request = self
            .http
            .post(endpoint(base, OPTIONS_PATH))
            .timeout(self.config.load_timeout)
            .json(&body);
        self.send(request).await?;
        Ok(())
    }
}
