//! Shard connection lifecycle states

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Lifecycle state of a shard's gateway connection
///
/// `Disconnected -> Connecting -> Identifying | Resuming -> Connected -> Disconnected`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShardState {
    /// No socket; either stopped or waiting to reconnect
    #[default]
    Disconnected,
    /// Socket opening, or open and waiting for Hello / handshake permission
    Connecting,
    /// Identify sent, waiting for Ready
    Identifying,
    /// Resume sent, waiting for Resumed or replayed events
    Resuming,
    /// Session established
    Connected,
}

impl ShardState {
    /// Wire name of this state
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Identifying => "IDENTIFYING",
            Self::Resuming => "RESUMING",
            Self::Connected => "CONNECTED",
        }
    }

    /// Check if a handshake (identify or resume) is in flight
    #[must_use]
    pub const fn is_handshaking(self) -> bool {
        matches!(self, Self::Identifying | Self::Resuming)
    }

    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShardState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DISCONNECTED" => Ok(Self::Disconnected),
            "CONNECTING" => Ok(Self::Connecting),
            "IDENTIFYING" => Ok(Self::Identifying),
            "RESUMING" => Ok(Self::Resuming),
            "CONNECTED" => Ok(Self::Connected),
            other => Err(CoreError::UnknownShardState(other.to_string())),
        }
    }
}
