//! REST error types

use thiserror::Error;

use crate::ipc::RemoteError;

/// REST layer errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RestError {
    /// Method name outside the supported operation set
    #[error("Unknown REST operation: {0}")]
    UnknownOperation(String),

    #[error("Invalid arguments for {method}: {reason}")]
    InvalidArguments { method: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid response body: {0}")]
    Decode(String),

    /// Failure reported by the process that ran the request
    #[error(transparent)]
    Remote(RemoteError),
}

impl RestError {
    pub fn to_remote(&self) -> RemoteError {
        match self {
            Self::Remote(remote) => remote.clone(),
            other => RemoteError::new("RestError", other.to_string()),
        }
    }
}

impl From<reqwest::Error> for RestError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Http(err.to_string())
        }
    }
}
