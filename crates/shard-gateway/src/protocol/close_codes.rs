//! WebSocket close codes
//!
//! Codes the gateway sends when it closes a shard's socket, plus the codes this client
//! uses when it closes the socket itself. What a code means for the shard is decided
//! here: stop for good, start a fresh session, or resume.

use serde::{Deserialize, Serialize};

/// Close codes seen on a shard socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum CloseCode {
    /// Clean shutdown; the session is discarded
    Normal = 1000,
    UnknownError = 4000,
    UnknownOpcode = 4001,
    DecodeError = 4002,
    /// A frame other than Identify/Resume went out first
    NotAuthenticated = 4003,
    AuthenticationFailed = 4004,
    /// Identify sent on an already identified socket
    AlreadyAuthenticated = 4005,
    /// The sequence in our Resume was rejected
    InvalidSequence = 4007,
    /// Send budget exceeded
    RateLimited = 4008,
    SessionTimedOut = 4009,
    InvalidShard = 4010,
    ShardingRequired = 4011,
    InvalidApiVersion = 4012,
    InvalidIntents = 4013,
    DisallowedIntents = 4014,
    /// Sent by us: the previous heartbeat was never acknowledged
    HeartbeatTimeout = 4900,
    /// Sent by us: the gateway (or the shard's owner) asked for a new socket
    ReconnectRequested = 4901,
}

/// What a shard does after its socket closed with a given code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// Configuration problem; reconnecting would fail the same way
    Fatal,
    /// Reconnect with a new Identify
    NewSession,
    /// Reconnect and Resume the cached session
    Resumable,
}

impl CloseCode {
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    #[must_use]
    pub const fn kind(self) -> CloseKind {
        match self {
            Self::AuthenticationFailed
            | Self::InvalidShard
            | Self::ShardingRequired
            | Self::InvalidApiVersion
            | Self::InvalidIntents
            | Self::DisallowedIntents => CloseKind::Fatal,
            Self::Normal | Self::InvalidSequence | Self::SessionTimedOut => CloseKind::NewSession,
            _ => CloseKind::Resumable,
        }
    }

    /// Closing with this code means the shard must not reconnect
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(self.kind(), CloseKind::Fatal)
    }

    /// The cached session can still be resumed after this code
    #[must_use]
    pub const fn preserves_session(self) -> bool {
        matches!(self.kind(), CloseKind::Resumable)
    }

    /// Close reason as put in the close frame and in logs
    #[must_use]
    pub const fn reason(self) -> &'static str {
        match self {
            Self::Normal => "shard closed",
            Self::UnknownError => "gateway error, reconnect",
            Self::UnknownOpcode => "gateway rejected an opcode",
            Self::DecodeError => "gateway could not decode a frame",
            Self::NotAuthenticated => "frame sent before identify",
            Self::AuthenticationFailed => "token rejected",
            Self::AlreadyAuthenticated => "identified twice",
            Self::InvalidSequence => "resume sequence rejected",
            Self::RateLimited => "send budget exceeded",
            Self::SessionTimedOut => "session expired",
            Self::InvalidShard => "shard id or count rejected",
            Self::ShardingRequired => "more shards required",
            Self::InvalidApiVersion => "gateway version rejected",
            Self::InvalidIntents => "intents rejected",
            Self::DisallowedIntents => "intents not enabled for this application",
            Self::HeartbeatTimeout => "heartbeat not acknowledged",
            Self::ReconnectRequested => "reconnecting",
        }
    }
}

impl TryFrom<u16> for CloseCode {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        let code = match value {
            1000 => Self::Normal,
            4000 => Self::UnknownError,
            4001 => Self::UnknownOpcode,
            4002 => Self::DecodeError,
            4003 => Self::NotAuthenticated,
            4004 => Self::AuthenticationFailed,
            4005 => Self::AlreadyAuthenticated,
            4007 => Self::InvalidSequence,
            4008 => Self::RateLimited,
            4009 => Self::SessionTimedOut,
            4010 => Self::InvalidShard,
            4011 => Self::ShardingRequired,
            4012 => Self::InvalidApiVersion,
            4013 => Self::InvalidIntents,
            4014 => Self::DisallowedIntents,
            4900 => Self::HeartbeatTimeout,
            4901 => Self::ReconnectRequested,
            other => return Err(other),
        };
        Ok(code)
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code.as_u16()
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.reason())
    }
}
