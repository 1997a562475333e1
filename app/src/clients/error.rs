#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("Request timed out")]
    Timeout,
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Engine returned status {status}: {body}")]
    Status { status: u16, body: String },
    /// The engine rejected the request body (HTTP 422)
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Failed to decode response: {0}")]
    Decode(String),
}

impl ClientError {
    /// Returns a user-friendly error message suitable for display in the UI
    pub fn user_message(&self) -> String {
        match self {
            ClientError::Timeout => {
                "The engine did not respond in time. It may still be busy.".to_string()
            }
            ClientError::Transport(_) => "Could not reach the engine.".to_string(),
            ClientError::Status { status: 401, .. } => {
                "The engine rejected the API credentials.".to_string()
            }
            ClientError::Status { status, .. } => {
                format!("The engine returned an error (HTTP {}).", status)
            }
            ClientError::Validation(detail) => detail.clone(),
            ClientError::Decode(_) => "The engine sent a response we could not read.".to_string(),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ClientError::Timeout
        } else if e.is_decode() {
            ClientError::Decode(e.to_string())
        } else {
            ClientError::Transport(e.to_string())
        }
    }
}
