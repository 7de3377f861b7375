//! Per-worker environment
//!
//! The parent passes each worker its cluster assignment through environment variables.

use shard_core::ClusterSpec;
use std::env;

use super::app_config::{parse_var, ConfigError};

/// Cluster assignment handed to a worker process at spawn time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerEnv {
    pub cluster_id: u32,
    pub cluster_count: u32,
    /// Total shard count of the deployment
    pub shard_count: u32,
    pub first_shard_id: u32,
    pub last_shard_id: u32,
}

impl WorkerEnv {
    pub const CLUSTER_ID: &'static str = "CLUSTER_ID";
    pub const CLUSTER_COUNT: &'static str = "CLUSTER_COUNT";
    pub const SHARD_COUNT: &'static str = "SHARD_COUNT";
    pub const FIRST_SHARD_ID: &'static str = "FIRST_SHARD_ID";
    pub const LAST_SHARD_ID: &'static str = "LAST_SHARD_ID";

    /// Build the environment for one cluster of a layout
    pub fn for_cluster(spec: &ClusterSpec, cluster_count: u32) -> Self {
        Self {
            cluster_id: spec.id,
            cluster_count,
            shard_count: spec.total_shards,
            first_shard_id: spec.first_shard,
            last_shard_id: spec.last_shard,
        }
    }

    /// Whether the current process was started as a worker
    pub fn is_worker() -> bool {
        env::var_os(Self::CLUSTER_ID).is_some()
    }

    /// Read the worker assignment from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let require = |name: &'static str| -> Result<u32, ConfigError> {
            parse_var(&lookup, name)?.ok_or(ConfigError::MissingVar(name))
        };

        let worker = Self {
            cluster_id: require(Self::CLUSTER_ID)?,
            cluster_count: require(Self::CLUSTER_COUNT)?,
            shard_count: require(Self::SHARD_COUNT)?,
            first_shard_id: require(Self::FIRST_SHARD_ID)?,
            last_shard_id: require(Self::LAST_SHARD_ID)?,
        };

        if worker.first_shard_id > worker.last_shard_id {
            return Err(ConfigError::InvalidValue(
                Self::FIRST_SHARD_ID,
                worker.first_shard_id.to_string(),
            ));
        }
        if worker.last_shard_id >= worker.shard_count {
            return Err(ConfigError::InvalidValue(
                Self::LAST_SHARD_ID,
                worker.last_shard_id.to_string(),
            ));
        }

        Ok(worker)
    }

    /// Variables to set on the spawned worker
    pub fn to_vars(&self) -> Vec<(&'static str, String)> {
        vec![
            (Self::CLUSTER_ID, self.cluster_id.to_string()),
            (Self::CLUSTER_COUNT, self.cluster_count.to_string()),
            (Self::SHARD_COUNT, self.shard_count.to_string()),
            (Self::FIRST_SHARD_ID, self.first_shard_id.to_string()),
            (Self::LAST_SHARD_ID, self.last_shard_id.to_string()),
        ]
    }

    /// The cluster spec this worker runs
    pub fn spec(&self) -> ClusterSpec {
        ClusterSpec {
            id: self.cluster_id,
            first_shard: self.first_shard_id,
            last_shard: self.last_shard_id,
            total_shards: self.shard_count,
        }
    }
}
