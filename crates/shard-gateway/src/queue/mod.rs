//! Rate-limited queues
//!
//! Serialize work per resource key: outbound frames of one shard, or handshakes of one
//! concurrency group.

mod rate_limited_queue;
mod registry;

pub use rate_limited_queue::{QueueTask, RateLimitedQueue};
pub use registry::QueueRegistry;
