use thiserror::Error;

/// Client-level error type shared by the transport, history and orchestrator layers.
///
/// `Cancelled` is an expected outcome (a newer submission superseded the
/// request) and must never be shown to the user; see [`ClientError::is_cancelled`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Validation error: {0}")]
    Validation(String),

    /// Non-success HTTP status. Displays as the server-provided message only,
    /// since that text is what the user sees.
    #[error("{message}")]
    Remote { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Malformed event stream: {0}")]
    Decode(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Operation not supported by this backing: {0}")]
    Unsupported(&'static str),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl ClientError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ClientError::Cancelled)
    }

    /// Text suitable for the error banner.
    pub fn user_message(&self) -> String {
        match self {
            ClientError::Remote { message, .. } => message.clone(),
            ClientError::Transport(e) if e.is_connect() => {
                "Could not reach the generation service".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Storage(e.to_string())
    }
}
