//! Queue registry
//!
//! Owns one `RateLimitedQueue` per key, created on first use and dropped again after it
//! has been idle for the expiry window (unless the keep-alive predicate holds it).

use dashmap::DashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use super::{QueueTask, RateLimitedQueue};

type KeepAlive<K> = Box<dyn Fn(&K) -> bool + Send + Sync>;

/// Keyed collection of rate-limited queues
pub struct QueueRegistry<K> {
    queues: DashMap<K, Arc<RateLimitedQueue<K>>>,
    expire_after: Duration,
    /// Returning `true` keeps an idle queue registered past its expiry
    keep_alive: Option<KeepAlive<K>>,
}

impl<K> QueueRegistry<K>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
{
    /// Create a registry whose idle queues expire after `expire_after`
    #[must_use]
    pub fn new(expire_after: Duration) -> Arc<Self> {
        Arc::new(Self {
            queues: DashMap::new(),
            expire_after,
            keep_alive: None,
        })
    }

    /// Create a registry with a keep-alive predicate consulted on expiry
    #[must_use]
    pub fn with_keep_alive(
        expire_after: Duration,
        keep_alive: impl Fn(&K) -> bool + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            queues: DashMap::new(),
            expire_after,
            keep_alive: Some(Box::new(keep_alive)),
        })
    }

    /// Enqueue a task on the queue for `key`
    pub fn enqueue(self: &Arc<Self>, key: &K, task: QueueTask, prepend: bool) {
        // The entry guard is held while enqueueing so expiry cannot remove the queue
        // between lookup and insert.
        let entry = self
            .queues
            .entry(key.clone())
            .or_insert_with(|| self.create(key));
        entry.value().enqueue(task, prepend);
    }

    /// Lock the queue for `key`
    pub fn lock(self: &Arc<Self>, key: &K, duration: Duration) {
        let entry = self
            .queues
            .entry(key.clone())
            .or_insert_with(|| self.create(key));
        entry.value().lock(duration);
    }

    /// Unlock the queue for `key` ahead of its timer, if it exists
    pub fn unlock(&self, key: &K) {
        if let Some(queue) = self.get(key) {
            queue.unlock();
        }
    }

    /// Drop pending tasks of the queue for `key`, if it exists
    pub fn clear(&self, key: &K) {
        if let Some(queue) = self.queues.get(key) {
            queue.clear();
        }
    }

    pub fn get(&self, key: &K) -> Option<Arc<RateLimitedQueue<K>>> {
        self.queues.get(key).map(|q| Arc::clone(q.value()))
    }

    pub fn contains(&self, key: &K) -> bool {
        self.queues.contains_key(key)
    }

    /// Number of live queues
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    fn create(self: &Arc<Self>, key: &K) -> Arc<RateLimitedQueue<K>> {
        tracing::trace!(key = ?key, "Queue created");
        RateLimitedQueue::registered(key.clone(), Arc::downgrade(self), self.expire_after)
    }

    /// Remove `queue` if it is still the registered instance for its key and still idle
    ///
    /// A queue the keep-alive predicate holds on to gets another idle window.
    pub(super) fn expire(&self, queue: &Arc<RateLimitedQueue<K>>) {
        let mut kept_alive = false;
        let removed = self.queues.remove_if(queue.key(), |key, current| {
            if !Arc::ptr_eq(current, queue) || !current.is_idle() {
                return false;
            }
            kept_alive = self.keep_alive.as_ref().is_some_and(|keep| keep(key));
            !kept_alive
        });

        if removed.is_some() {
            tracing::trace!(key = ?queue.key(), "Idle queue expired");
        } else if kept_alive {
            tracing::trace!(key = ?queue.key(), "Idle queue kept alive");
            queue.rearm_expiry();
        }
    }
}

impl<K: Eq + Hash> fmt::Debug for QueueRegistry<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueRegistry")
            .field("queues", &self.queues.len())
            .field("expire_after", &self.expire_after)
            .finish()
    }
}
