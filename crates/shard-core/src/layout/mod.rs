//! Shard-range-to-cluster layout and handshake concurrency groups

mod cluster_layout;

pub use cluster_layout::{concurrency_group, ClusterLayout, ClusterSpec};
