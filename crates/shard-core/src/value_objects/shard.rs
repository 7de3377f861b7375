//! Shard identity

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::error::CoreError;

/// Identity of one shard: its id and the total shard count of the deployment.
///
/// Serialized as the `[shard_id, shard_count]` pair the gateway expects in Identify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardInfo {
    id: u32,
    count: u32,
}

impl ShardInfo {
    /// Create a shard identity, validating that the id fits in the count
    pub fn new(id: u32, count: u32) -> Result<Self, CoreError> {
        if count == 0 {
            return Err(CoreError::NoShards);
        }
        if id >= count {
            return Err(CoreError::ShardOutOfRange { shard_id: id, total: count });
        }
        Ok(Self { id, count })
    }

    #[inline]
    pub const fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub const fn count(&self) -> u32 {
        self.count
    }

    /// The `[id, count]` pair
    #[inline]
    pub const fn as_pair(&self) -> [u32; 2] {
        [self.id, self.count]
    }
}

impl fmt::Display for ShardInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.id, self.count)
    }
}

impl Serialize for ShardInfo {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.as_pair().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ShardInfo {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let [id, count] = <[u32; 2]>::deserialize(deserializer)?;
        Self::new(id, count).map_err(serde::de::Error::custom)
    }
}
