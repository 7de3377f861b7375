//! Core errors - error types for the domain layer

use thiserror::Error;

/// Domain layer errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    // =========================================================================
    // Layout Errors
    // =========================================================================
    #[error("Total shard count must be greater than zero")]
    NoShards,

    #[error("Cluster count must be greater than zero")]
    NoClusters,

    #[error("Invalid shard range: first {first} is greater than last {last}")]
    InvalidShardRange { first: u32, last: u32 },

    #[error("Shard {shard_id} is outside the shard count {total}")]
    ShardOutOfRange { shard_id: u32, total: u32 },

    #[error("Cannot split {shards} shards across {clusters} clusters")]
    TooManyClusters { clusters: u32, shards: u32 },

    #[error("Max concurrency must be greater than zero")]
    InvalidConcurrency,

    // =========================================================================
    // Parsing Errors
    // =========================================================================
    #[error("Unknown shard state: {0}")]
    UnknownShardState(String),
}

impl CoreError {
    /// Get an error code string for logs and IPC error payloads
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoShards => "NO_SHARDS",
            Self::NoClusters => "NO_CLUSTERS",
            Self::InvalidShardRange { .. } => "INVALID_SHARD_RANGE",
            Self::ShardOutOfRange { .. } => "SHARD_OUT_OF_RANGE",
            Self::TooManyClusters { .. } => "TOO_MANY_CLUSTERS",
            Self::InvalidConcurrency => "INVALID_CONCURRENCY",
            Self::UnknownShardState(_) => "UNKNOWN_SHARD_STATE",
        }
    }

    /// Check if this error comes from an invalid layout request
    pub fn is_layout(&self) -> bool {
        matches!(
            self,
            Self::NoShards
                | Self::NoClusters
                | Self::InvalidShardRange { .. }
                | Self::ShardOutOfRange { .. }
                | Self::TooManyClusters { .. }
                | Self::InvalidConcurrency
        )
    }
}
