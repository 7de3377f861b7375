//! # shard-core
//!
//! Domain layer shared by the gateway client and the cluster layer: shard identity,
//! connection lifecycle states, shard-range-to-cluster layout and correlation nonces.
//! This crate has no runtime or transport dependencies.

pub mod error;
pub mod layout;
pub mod value_objects;

// Re-export commonly used types at crate root
pub use error::CoreError;
pub use layout::{concurrency_group, ClusterLayout, ClusterSpec};
pub use value_objects::{Nonce, NonceGenerator, NonceParseError, ShardInfo, ShardState};
