use std::fmt;
use std::time::Duration;

use secrecy::SecretString;

/// Environment variable holding `user:password` for the engine's API auth.
pub const API_AUTH_ENV: &str = "EASEL_API_AUTH";

/// HTTP basic credentials for an engine started with `--api-auth`.
#[derive(Clone)]
pub struct ApiCredentials {
    pub username: String,
    pub password: SecretString,
}

impl fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl ApiCredentials {
    /// Parses `user:password`. Anything without a colon is rejected.
    pub fn parse(value: &str) -> Option<Self> {
        let (username, password) = value.split_once(':')?;
        if username.is_empty() {
            return None;
        }
        Some(Self {
            username: username.to_string(),
            password: SecretString::from(password.to_string()),
        })
    }

    pub fn from_env() -> Option<Self> {
        std::env::var(API_AUTH_ENV)
            .ok()
            .and_then(|value| Self::parse(&value))
    }
}

/// Configuration for talking to the engine's REST API
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Applied to every call except setting the checkpoint
    pub request_timeout: Duration,
    /// Setting the checkpoint blocks until the engine has loaded it
    pub load_timeout: Duration,
    pub credentials: Option<ApiCredentials>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            load_timeout: Duration::from_secs(600),
            credentials: None,
        }
    }
}
