//! Value objects - immutable types that represent domain concepts

mod nonce;
mod shard;
mod shard_state;

pub use nonce::{Nonce, NonceGenerator, NonceParseError};
pub use shard::ShardInfo;
pub use shard_state::ShardState;
