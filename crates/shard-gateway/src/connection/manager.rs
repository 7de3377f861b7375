//! Shard manager
//!
//! Owns every shard of a process using DashMap for thread-safe access. Shards share one
//! outbound queue registry and one event bus.

use dashmap::DashMap;
use shard_core::{ShardInfo, ShardState};
use std::ops::RangeInclusive;
use std::sync::Arc;

use super::{HandshakeGate, ShardConfig, ShardConnection, ShardHandle};
use crate::error::{GatewayError, GatewayResult};
use crate::events::{EventBus, ShardEvent};
use crate::queue::QueueRegistry;

/// Manages the shards of one process
pub struct ShardManager {
    config: Arc<ShardConfig>,
    gate: Arc<dyn HandshakeGate>,
    shard_count: u32,

    /// Outbound frame queues keyed by shard id
    queues: Arc<QueueRegistry<u32>>,

    /// Running shards by id
    shards: Arc<DashMap<u32, ShardHandle>>,

    events: EventBus<ShardEvent>,
}

impl ShardManager {
    /// Create a manager for a deployment of `shard_count` shards
    pub fn new(config: ShardConfig, gate: Arc<dyn HandshakeGate>, shard_count: u32) -> Self {
        let shards: Arc<DashMap<u32, ShardHandle>> = Arc::new(DashMap::new());

        // A handshaking shard's queue must survive idle expiry. Weak, so dropping the
        // manager drops the handles and lets runners see their command channel close.
        let handshaking = Arc::downgrade(&shards);
        let queues = QueueRegistry::with_keep_alive(config.queue_expire, move |shard_id: &u32| {
            handshaking.upgrade().is_some_and(|shards| {
                shards
                    .get(shard_id)
                    .is_some_and(|handle| handle.state().is_handshaking())
            })
        });

        Self {
            config: Arc::new(config),
            gate,
            shard_count,
            queues,
            shards,
            events: EventBus::new(),
        }
    }

    /// Start a shard; an already running shard is returned as-is
    pub fn spawn(&self, shard_id: u32) -> GatewayResult<ShardHandle> {
        let shard = ShardInfo::new(shard_id, self.shard_count)?;

        if let Some(existing) = self.shards.get(&shard_id) {
            if existing.is_running() {
                return Ok(existing.clone());
            }
        }

        let handle = ShardConnection::new(
            shard,
            Arc::clone(&self.config),
            Arc::clone(&self.gate),
            Arc::clone(&self.queues),
            self.events.clone(),
        )
        .spawn();
        self.shards.insert(shard_id, handle.clone());

        tracing::debug!(shard_id, shard_count = self.shard_count, "Shard spawned");

        Ok(handle)
    }

    /// Start every shard in `ids`
    pub fn spawn_range(&self, ids: RangeInclusive<u32>) -> GatewayResult<Vec<ShardHandle>> {
        ids.map(|shard_id| self.spawn(shard_id)).collect()
    }

    /// Get a shard by id
    pub fn get(&self, shard_id: u32) -> Option<ShardHandle> {
        self.shards.get(&shard_id).map(|r| r.clone())
    }

    /// Get a shard or fail with [`GatewayError::UnknownShard`]
    pub fn require(&self, shard_id: u32) -> GatewayResult<ShardHandle> {
        self.get(shard_id).ok_or(GatewayError::UnknownShard(shard_id))
    }

    pub fn contains(&self, shard_id: u32) -> bool {
        self.shards.contains_key(&shard_id)
    }

    /// Managed shard ids, ascending
    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.shards.iter().map(|r| *r.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Current state of every shard, ascending by id
    pub fn states(&self) -> Vec<(u32, ShardState)> {
        let mut states: Vec<(u32, ShardState)> = self
            .shards
            .iter()
            .map(|r| (*r.key(), r.value().state()))
            .collect();
        states.sort_unstable_by_key(|(id, _)| *id);
        states
    }

    /// Kill and forget one shard
    pub fn remove(&self, shard_id: u32) -> Option<ShardHandle> {
        let (_, handle) = self.shards.remove(&shard_id)?;
        let _ = handle.kill();
        tracing::debug!(shard_id, "Shard removed");
        Some(handle)
    }

    /// Kill every shard
    pub fn kill_all(&self) {
        for entry in self.shards.iter() {
            let _ = entry.value().kill();
        }
        tracing::info!(count = self.shards.len(), "All shards killed");
    }

    /// Subscribe to events from every shard
    pub fn events(&self) -> &EventBus<ShardEvent> {
        &self.events
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ImmediateGate, SessionConfig};

    fn manager(shard_count: u32) -> ShardManager {
        // Port 9 is discard; connects fail and shards sit in backoff
        let config = ShardConfig::new("ws://127.0.0.1:9", SessionConfig::new("token", 0));
        ShardManager::new(config, Arc::new(ImmediateGate), shard_count)
    }

    #[tokio::test]
    async fn test_spawn_rejects_out_of_range() {
        let manager = manager(2);
        assert!(matches!(manager.spawn(2), Err(GatewayError::Layout(_))));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_spawn_range_and_lookup() {
        let manager = manager(4);
        let handles = manager.spawn_range(1..=3).unwrap();

        assert_eq!(handles.len(), 3);
        assert_eq!(manager.ids(), vec![1, 2, 3]);
        assert!(manager.contains(2));
        assert!(!manager.contains(0));
        assert!(matches!(manager.require(0), Err(GatewayError::UnknownShard(0))));
        assert_eq!(manager.get(3).unwrap().shard().count(), 4);

        manager.kill_all();
    }

    #[tokio::test]
    async fn test_spawn_twice_returns_running_shard() {
        let manager = manager(1);
        let first = manager.spawn(0).unwrap();
        let second = manager.spawn(0).unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(manager.len(), 1);
        manager.kill_all();
    }

    #[tokio::test]
    async fn test_killed_shard_stops() {
        let manager = manager(1);
        let mut events = manager.events().subscribe();
        let handle = manager.spawn(0).unwrap();

        handle.kill().unwrap();
        loop {
            if let ShardEvent::Stopped { shard_id, .. } = events.recv().await.unwrap() {
                assert_eq!(shard_id, 0);
                break;
            }
        }
        assert_eq!(handle.state(), ShardState::Disconnected);
    }
}
