//! Cluster events
//!
//! Published by the orchestrator and its supervisors for application code and tests.

use shard_core::ShardState;

/// Something that happened to a worker or one of its shards
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// Worker process started
    Spawned { cluster_id: u32, pid: Option<u32> },
    /// Worker reported READY
    Ready { cluster_id: u32 },
    /// Worker process exited
    Exited {
        cluster_id: u32,
        code: Option<i32>,
        /// Whether a replacement will be spawned
        respawning: bool,
    },
    /// A shard changed lifecycle state
    ShardState {
        cluster_id: u32,
        shard_id: u32,
        old: ShardState,
        new: ShardState,
    },
    /// A shard's socket closed
    ShardClosed {
        cluster_id: u32,
        shard_id: u32,
        code: Option<u16>,
        reason: String,
    },
}

impl ClusterEvent {
    pub fn cluster_id(&self) -> u32 {
        match self {
            Self::Spawned { cluster_id, .. }
            | Self::Ready { cluster_id }
            | Self::Exited { cluster_id, .. }
            | Self::ShardState { cluster_id, .. }
            | Self::ShardClosed { cluster_id, .. } => *cluster_id,
        }
    }
}
