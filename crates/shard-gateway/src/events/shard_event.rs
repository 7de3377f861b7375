//! Events emitted by a shard connection

use serde_json::Value;
use shard_core::ShardState;
use std::time::Duration;

/// Something that happened on one shard
#[derive(Debug, Clone, PartialEq)]
pub enum ShardEvent {
    /// Lifecycle transition
    StateChanged {
        shard_id: u32,
        old: ShardState,
        new: ShardState,
    },
    /// New session established
    Ready { shard_id: u32, session_id: String },
    /// Dropped session continued
    Resumed { shard_id: u32 },
    /// Gateway dispatch (READY and RESUMED included)
    Dispatch {
        shard_id: u32,
        event_type: String,
        sequence: u64,
        data: Value,
    },
    /// Heartbeat round-trip completed
    HeartbeatAck { shard_id: u32, latency: Duration },
    /// Socket closed (by either side)
    Closed {
        shard_id: u32,
        code: Option<u16>,
        reason: String,
    },
    /// Waiting before the next connection attempt
    Reconnecting { shard_id: u32, delay: Duration },
    /// Runner exited; the shard will not reconnect
    Stopped { shard_id: u32, code: Option<u16> },
}

impl ShardEvent {
    pub fn shard_id(&self) -> u32 {
        match self {
            Self::StateChanged { shard_id, .. }
            | Self::Ready { shard_id, .. }
            | Self::Resumed { shard_id }
            | Self::Dispatch { shard_id, .. }
            | Self::HeartbeatAck { shard_id, .. }
            | Self::Closed { shard_id, .. }
            | Self::Reconnecting { shard_id, .. }
            | Self::Stopped { shard_id, .. } => *shard_id,
        }
    }

    /// Short name for logs
    pub const fn name(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "STATE_CHANGED",
            Self::Ready { .. } => "READY",
            Self::Resumed { .. } => "RESUMED",
            Self::Dispatch { .. } => "DISPATCH",
            Self::HeartbeatAck { .. } => "HEARTBEAT_ACK",
            Self::Closed { .. } => "CLOSED",
            Self::Reconnecting { .. } => "RECONNECTING",
            Self::Stopped { .. } => "STOPPED",
        }
    }
}
