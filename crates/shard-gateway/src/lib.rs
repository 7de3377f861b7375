//! # shard-gateway
//!
//! Sharded gateway client: wire protocol, one reconnecting WebSocket connection per
//! shard, and the rate-limited queues that pace outbound frames and handshakes.

pub mod connection;
pub mod error;
pub mod events;
pub mod protocol;
pub mod queue;

pub use connection::{
    HandshakeGate, ImmediateGate, SessionConfig, ShardConfig, ShardHandle, ShardManager,
    SpacedGate,
};
pub use error::{GatewayError, GatewayResult};
pub use events::{EventBus, ShardEvent};
pub use protocol::{CloseCode, CloseKind, GatewayMessage, OpCode};
pub use queue::{QueueRegistry, QueueTask, RateLimitedQueue};
