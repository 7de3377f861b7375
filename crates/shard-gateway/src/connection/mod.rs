//! Shard connections
//!
//! Session state machine, per-shard runner task, handshake gating and the manager that
//! owns a process's shards.

mod backoff;
mod config;
mod gate;
mod handle;
mod manager;
mod runner;
mod send_budget;
mod session;

pub use backoff::Backoff;
pub use config::ShardConfig;
pub use gate::{HandshakeGate, ImmediateGate, SpacedGate};
pub use handle::ShardHandle;
pub use manager::ShardManager;
pub use runner::ShardConnection;
pub use send_budget::SendBudget;
pub use session::{CloseDisposition, SessionConfig, ShardAction, ShardSession};
