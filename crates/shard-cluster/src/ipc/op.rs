//! IPC operations

use serde::{Deserialize, Serialize};
use std::fmt;

/// Operation carried by an [`IpcMessage`](super::IpcMessage)
///
/// | op | direction | meaning |
/// |---|---|---|
/// | `CLOSE` | child -> parent | a shard socket closed |
/// | `EVAL` | both | evaluation request or reply |
/// | `IDENTIFY_REQUEST` | child -> parent ask, parent -> child grant | handshake permission |
/// | `READY` | child -> parent | worker bootstrapped |
/// | `SHARD_STATE` | child -> parent | shard lifecycle transition |
/// | `REST_REQUEST` | child -> parent, replied | proxied REST call |
/// | `RESPAWN_ALL` | child -> parent | restart every cluster |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IpcOp {
    Close,
    Eval,
    IdentifyRequest,
    Ready,
    ShardState,
    RestRequest,
    RespawnAll,
}

impl IpcOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Close => "CLOSE",
            Self::Eval => "EVAL",
            Self::IdentifyRequest => "IDENTIFY_REQUEST",
            Self::Ready => "READY",
            Self::ShardState => "SHARD_STATE",
            Self::RestRequest => "REST_REQUEST",
            Self::RespawnAll => "RESPAWN_ALL",
        }
    }
}

impl fmt::Display for IpcOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
