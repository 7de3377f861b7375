//! Cluster layout
//!
//! Splits a contiguous range of shard ids into one contiguous sub-range per cluster.

use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

use crate::error::CoreError;

/// The shards one cluster (worker process) is responsible for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Cluster id (0-based)
    pub id: u32,
    /// First shard id owned by this cluster
    pub first_shard: u32,
    /// Last shard id owned by this cluster (inclusive)
    pub last_shard: u32,
    /// Total shard count of the whole deployment
    pub total_shards: u32,
}

impl ClusterSpec {
    /// Shard ids owned by this cluster
    pub fn shard_ids(&self) -> RangeInclusive<u32> {
        self.first_shard..=self.last_shard
    }

    /// Number of shards owned by this cluster
    pub fn shard_count(&self) -> u32 {
        self.last_shard - self.first_shard + 1
    }

    pub fn contains(&self, shard_id: u32) -> bool {
        self.shard_ids().contains(&shard_id)
    }
}

/// Mapping of every shard in the deployment to its cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterLayout {
    total_shards: u32,
    clusters: Vec<ClusterSpec>,
}

impl ClusterLayout {
    /// Compute the layout for shards `first_shard..=last_shard` out of `total_shards`
    ///
    /// Clusters receive near-equal contiguous ranges; when the shards do not divide evenly
    /// the first clusters take one extra shard each.
    pub fn compute(
        first_shard: u32,
        last_shard: u32,
        total_shards: u32,
        cluster_count: u32,
    ) -> Result<Self, CoreError> {
        if total_shards == 0 {
            return Err(CoreError::NoShards);
        }
        if cluster_count == 0 {
            return Err(CoreError::NoClusters);
        }
        if first_shard > last_shard {
            return Err(CoreError::InvalidShardRange {
                first: first_shard,
                last: last_shard,
            });
        }
        if last_shard >= total_shards {
            return Err(CoreError::ShardOutOfRange {
                shard_id: last_shard,
                total: total_shards,
            });
        }

        let shards = last_shard - first_shard + 1;
        if cluster_count > shards {
            return Err(CoreError::TooManyClusters {
                clusters: cluster_count,
                shards,
            });
        }

        let base = shards / cluster_count;
        let remainder = shards % cluster_count;

        let mut next = first_shard;
        let clusters = (0..cluster_count)
            .map(|id| {
                let size = base + u32::from(id < remainder);
                let spec = ClusterSpec {
                    id,
                    first_shard: next,
                    last_shard: next + size - 1,
                    total_shards,
                };
                next += size;
                spec
            })
            .collect();

        Ok(Self {
            total_shards,
            clusters,
        })
    }

    /// Layout covering every shard of the deployment
    pub fn for_all_shards(total_shards: u32, cluster_count: u32) -> Result<Self, CoreError> {
        if total_shards == 0 {
            return Err(CoreError::NoShards);
        }
        Self::compute(0, total_shards - 1, total_shards, cluster_count)
    }

    pub fn total_shards(&self) -> u32 {
        self.total_shards
    }

    pub fn clusters(&self) -> &[ClusterSpec] {
        &self.clusters
    }

    pub fn cluster_count(&self) -> u32 {
        self.clusters.len() as u32
    }

    pub fn cluster(&self, cluster_id: u32) -> Option<&ClusterSpec> {
        self.clusters.get(cluster_id as usize)
    }

    /// Find the cluster that owns a shard
    pub fn cluster_for_shard(&self, shard_id: u32) -> Option<&ClusterSpec> {
        self.clusters.iter().find(|c| c.contains(shard_id))
    }
}

/// Handshake concurrency group of a shard
///
/// Shards in the same group must not identify concurrently.
pub fn concurrency_group(shard_id: u32, max_concurrency: u32) -> Result<u32, CoreError> {
    if max_concurrency == 0 {
        return Err(CoreError::InvalidConcurrency);
    }
    Ok(shard_id % max_concurrency)
}
