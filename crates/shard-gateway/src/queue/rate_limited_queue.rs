//! Rate-limited task queue
//!
//! A FIFO of futures bound to one resource key. At most one task runs at a time; a
//! locked queue holds its tasks until it is unlocked (explicitly or by its timer).

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::QueueRegistry;

/// A unit of queued work
pub type QueueTask = BoxFuture<'static, ()>;

struct QueueInner {
    pending: VecDeque<QueueTask>,
    locked: bool,
    running: bool,
    unlock_timer: Option<JoinHandle<()>>,
    expire_timer: Option<JoinHandle<()>>,
}

/// FIFO queue that runs its tasks one at a time
pub struct RateLimitedQueue<K> {
    key: K,
    inner: Mutex<QueueInner>,
    /// Owning registry, consulted when the idle timer fires
    registry: Option<Weak<QueueRegistry<K>>>,
    expire_after: Duration,
}

impl<K> RateLimitedQueue<K>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
{
    /// Create a standalone queue that never expires
    #[must_use]
    pub fn new(key: K) -> Arc<Self> {
        Arc::new(Self::build(key, None, Duration::ZERO))
    }

    pub(super) fn registered(
        key: K,
        registry: Weak<QueueRegistry<K>>,
        expire_after: Duration,
    ) -> Arc<Self> {
        Arc::new(Self::build(key, Some(registry), expire_after))
    }

    fn build(key: K, registry: Option<Weak<QueueRegistry<K>>>, expire_after: Duration) -> Self {
        Self {
            key,
            inner: Mutex::new(QueueInner {
                pending: VecDeque::new(),
                locked: false,
                running: false,
                unlock_timer: None,
                expire_timer: None,
            }),
            registry,
            expire_after,
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    /// Add a task; `prepend` puts it ahead of everything already pending
    pub fn enqueue(self: &Arc<Self>, task: QueueTask, prepend: bool) {
        {
            let mut inner = self.inner.lock();
            if let Some(timer) = inner.expire_timer.take() {
                timer.abort();
            }
            if prepend {
                inner.pending.push_front(task);
            } else {
                inner.pending.push_back(task);
            }
        }
        self.advance();
    }

    /// Suspend execution for `duration`, then unlock automatically
    ///
    /// Locking an already locked queue restarts its unlock timer. A task that is already
    /// running is not interrupted.
    pub fn lock(self: &Arc<Self>, duration: Duration) {
        let mut inner = self.inner.lock();
        inner.locked = true;
        if let Some(timer) = inner.unlock_timer.take() {
            timer.abort();
        }
        if let Some(timer) = inner.expire_timer.take() {
            timer.abort();
        }

        let queue = Arc::downgrade(self);
        inner.unlock_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if let Some(queue) = queue.upgrade() {
                queue.unlock();
            }
        }));

        tracing::trace!(key = ?self.key, duration_ms = duration.as_millis(), "Queue locked");
    }

    /// Resume execution
    pub fn unlock(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            if let Some(timer) = inner.unlock_timer.take() {
                timer.abort();
            }
            if !inner.locked {
                return;
            }
            inner.locked = false;
        }
        tracing::trace!(key = ?self.key, "Queue unlocked");
        self.advance();
    }

    /// Drop every pending task (a running task finishes normally)
    pub fn clear(&self) {
        let dropped = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut inner.pending)
        };
        if !dropped.is_empty() {
            tracing::debug!(key = ?self.key, dropped = dropped.len(), "Queue cleared");
        }
    }

    /// Nothing pending, nothing running, not locked
    pub fn is_idle(&self) -> bool {
        let inner = self.inner.lock();
        inner.pending.is_empty() && !inner.running && !inner.locked
    }

    pub fn is_locked(&self) -> bool {
        self.inner.lock().locked
    }

    /// Number of pending (not yet started) tasks
    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn advance(self: &Arc<Self>) {
        let task = {
            let mut inner = self.inner.lock();
            if inner.locked || inner.running {
                return;
            }
            match inner.pending.pop_front() {
                Some(task) => {
                    inner.running = true;
                    task
                }
                None => {
                    self.arm_expiry(&mut inner);
                    return;
                }
            }
        };

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            // The task runs in its own tokio task so a panic surfaces as a JoinError
            // instead of tearing down this completion handler.
            if let Err(e) = tokio::spawn(task).await {
                if e.is_panic() {
                    tracing::error!(key = ?queue.key, "Queued task panicked");
                }
            }
            queue.complete();
        });
    }

    fn complete(self: &Arc<Self>) {
        self.inner.lock().running = false;
        self.advance();
    }

    /// Start another idle window after the registry kept this queue alive
    pub(super) fn rearm_expiry(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        // Runs on the expiry timer's own task, which must not abort itself
        inner.expire_timer = None;
        if inner.pending.is_empty() && !inner.running && !inner.locked {
            self.arm_expiry(&mut inner);
        }
    }

    fn arm_expiry(self: &Arc<Self>, inner: &mut QueueInner) {
        let Some(registry) = self.registry.clone() else {
            return;
        };
        if let Some(timer) = inner.expire_timer.take() {
            timer.abort();
        }

        let queue = Arc::downgrade(self);
        let expire_after = self.expire_after;
        inner.expire_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(expire_after).await;
            if let (Some(registry), Some(queue)) = (registry.upgrade(), queue.upgrade()) {
                registry.expire(&queue);
            }
        }));
    }
}

impl<K> Drop for RateLimitedQueue<K> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(timer) = inner.unlock_timer.take() {
            timer.abort();
        }
        if let Some(timer) = inner.expire_timer.take() {
            timer.abort();
        }
    }
}

impl<K: fmt::Debug> fmt::Debug for RateLimitedQueue<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("RateLimitedQueue")
            .field("key", &self.key)
            .field("pending", &inner.pending.len())
            .field("locked", &inner.locked)
            .field("running", &inner.running)
            .finish()
    }
}
