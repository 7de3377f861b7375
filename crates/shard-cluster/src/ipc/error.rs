//! IPC error types

use thiserror::Error;

use super::IpcOp;

/// IPC error types
#[derive(Debug, Clone, Error)]
pub enum IpcError {
    /// Message could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Line was not a valid message
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Underlying pipe failed
    #[error("IO error: {0}")]
    Io(String),

    /// The other end is gone
    #[error("Connection closed")]
    ConnectionClosed,

    /// `data` did not match the shape expected for `op`
    #[error("Unexpected {op} payload: {reason}")]
    UnexpectedPayload { op: IpcOp, reason: String },
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
