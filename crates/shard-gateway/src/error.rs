//! Gateway error types

use shard_core::CoreError;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Gateway client error type
#[derive(Debug, Error)]
pub enum GatewayError {
    /// WebSocket transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    /// Frame could not be encoded or decoded
    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    /// Handshake permission could not be obtained
    #[error("Handshake permission denied: {0}")]
    HandshakeDenied(String),

    /// The shard's runner has exited
    #[error("Shard {0} is not running")]
    ShardStopped(u32),

    /// Shard identity or layout rejected
    #[error(transparent)]
    Layout(#[from] CoreError),

    /// No shard with this id is managed here
    #[error("Unknown shard: {0}")]
    UnknownShard(u32),
}

impl GatewayError {
    /// Check if retrying could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::HandshakeDenied(_))
    }
}

/// Gateway result type
pub type GatewayResult<T> = Result<T, GatewayError>;
