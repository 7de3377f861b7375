//! Gateway operation codes

use serde::{Deserialize, Serialize};

/// The `op` field of a gateway frame
///
/// Frames the shard sends: Heartbeat, Identify, PresenceUpdate, VoiceStateUpdate,
/// Resume, RequestGuildMembers. Everything else arrives from the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum OpCode {
    Dispatch = 0,
    /// Sent periodically by the shard; the gateway may also demand one
    Heartbeat = 1,
    Identify = 2,
    PresenceUpdate = 3,
    VoiceStateUpdate = 4,
    Resume = 6,
    /// Gateway asks for a new socket and a Resume
    Reconnect = 7,
    RequestGuildMembers = 8,
    /// `d` tells whether the session may be resumed
    InvalidSession = 9,
    /// First frame on a socket, carries the heartbeat interval
    Hello = 10,
    HeartbeatAck = 11,
}

impl TryFrom<u8> for OpCode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Dispatch,
            1 => Self::Heartbeat,
            2 => Self::Identify,
            3 => Self::PresenceUpdate,
            4 => Self::VoiceStateUpdate,
            6 => Self::Resume,
            7 => Self::Reconnect,
            8 => Self::RequestGuildMembers,
            9 => Self::InvalidSession,
            10 => Self::Hello,
            11 => Self::HeartbeatAck,
            other => return Err(format!("invalid op code: {other}")),
        })
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> Self {
        op as u8
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?} ({})", u8::from(*self))
    }
}
