//! Shard events
//!
//! Typed events published by shard connections for caches, the cluster layer and tests.

mod bus;
mod shard_event;

pub use bus::EventBus;
pub use shard_event::ShardEvent;
