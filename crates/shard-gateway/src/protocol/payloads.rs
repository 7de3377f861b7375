//! Payload definitions
//!
//! Structures carried in the `d` field of gateway frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use shard_core::ShardInfo;

/// Payload for op 10 (Hello)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloPayload {
    /// Heartbeat interval in milliseconds
    pub heartbeat_interval: u64,
}

impl HelloPayload {
    /// Create a Hello payload with the given interval
    #[must_use]
    pub fn with_interval(heartbeat_interval: u64) -> Self {
        Self { heartbeat_interval }
    }
}

/// Payload for op 2 (Identify)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyPayload {
    /// Bot token, passed through verbatim
    pub token: String,

    /// Client connection properties
    pub properties: IdentifyProperties,

    /// `[shard_id, shard_count]`
    pub shard: ShardInfo,

    /// Gateway intents bitfield
    pub intents: u64,

    /// Member count above which offline members are not sent
    pub large_threshold: u32,

    /// Request compressed payloads
    pub compress: bool,

    /// Initial presence
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<PresenceUpdatePayload>,
}

/// Client connection properties
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyProperties {
    /// Operating system
    pub os: String,

    /// Library name
    pub browser: String,

    /// Library name
    pub device: String,
}

impl IdentifyProperties {
    /// Library name reported in Identify
    pub const LIBRARY: &'static str = "shard-cluster";
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: Self::LIBRARY.to_string(),
            device: Self::LIBRARY.to_string(),
        }
    }
}

/// Payload for op 6 (Resume)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumePayload {
    /// Bot token
    pub token: String,

    /// Session ID to resume
    pub session_id: String,

    /// Last received sequence number
    pub seq: u64,
}

/// Payload for op 3 (Presence Update)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdatePayload {
    /// Unix time (ms) since the client went idle
    pub since: Option<u64>,

    /// Activities, passed through as-is
    #[serde(default)]
    pub activities: Vec<Value>,

    /// New status (online, idle, dnd, invisible, offline)
    pub status: String,

    /// Whether the client is AFK
    #[serde(default)]
    pub afk: bool,
}

impl PresenceUpdatePayload {
    /// Valid status values
    pub const VALID_STATUSES: &'static [&'static str] =
        &["online", "idle", "dnd", "invisible", "offline"];

    /// Presence with a status and no activities
    #[must_use]
    pub fn with_status(status: impl Into<String>) -> Self {
        Self {
            since: None,
            activities: Vec::new(),
            status: status.into(),
            afk: false,
        }
    }

    /// Check if the status is valid
    #[must_use]
    pub fn is_valid_status(&self) -> bool {
        Self::VALID_STATUSES.contains(&self.status.as_str())
    }
}

/// Payload for op 4 (Voice State Update)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceStateUpdatePayload {
    pub guild_id: String,
    /// Channel to join, or `None` to disconnect
    pub channel_id: Option<String>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

/// `d` of the READY dispatch (only the fields the connection needs)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyPayload {
    pub session_id: String,

    /// URL to use when resuming this session
    #[serde(default)]
    pub resume_gateway_url: Option<String>,

    #[serde(default)]
    pub shard: Option<ShardInfo>,
}
