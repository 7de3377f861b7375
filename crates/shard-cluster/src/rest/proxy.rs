//! Parent-side REST proxy
//!
//! Workers send `REST_REQUEST`s to the parent, which runs them through one shared client.
//! Responses to read operations are kept for a short TTL keyed by method name and
//! arguments; identical requests arriving while one is in flight share its result.
//! Expired entries are swept out at most once per TTL, on the next cacheable request.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::{RestClient, RestError, RestOperation};

type SharedCall = Shared<BoxFuture<'static, Result<Value, RestError>>>;

struct CacheEntry {
    id: u64,
    created: Instant,
    call: SharedCall,
}

/// Caching, request-collapsing front of a [`RestClient`]
pub struct RestProxy {
    client: Arc<dyn RestClient>,
    ttl: Duration,
    cache: DashMap<String, CacheEntry>,
    next_id: AtomicU64,
    last_sweep: Mutex<Instant>,
}

impl RestProxy {
    pub fn new(client: Arc<dyn RestClient>, ttl: Duration) -> Self {
        Self {
            client,
            ttl,
            cache: DashMap::new(),
            next_id: AtomicU64::new(0),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    pub fn client(&self) -> &Arc<dyn RestClient> {
        &self.client
    }

    /// Run an operation, answering from the cache where allowed
    pub async fn execute(&self, operation: RestOperation) -> Result<Value, RestError> {
        if !operation.is_cacheable() || self.ttl.is_zero() {
            return self.client.execute(&operation).await;
        }

        self.sweep();
        let key = operation.cache_key();
        let (id, call) = self.lookup(&key, operation);
        let result = call.await;

        // Failures are not remembered; the next caller retries
        if result.is_err() {
            self.cache.remove_if(&key, |_, entry| entry.id == id);
        }
        result
    }

    fn lookup(&self, key: &str, operation: RestOperation) -> (u64, SharedCall) {
        let now = Instant::now();
        match self.cache.entry(key.to_string()) {
            Entry::Occupied(entry) if now < entry.get().created + self.ttl => {
                tracing::trace!(key = %key, "REST cache hit");
                (entry.get().id, entry.get().call.clone())
            }
            Entry::Occupied(mut entry) => {
                let fresh = self.start(operation, now);
                let handle = (fresh.id, fresh.call.clone());
                entry.insert(fresh);
                handle
            }
            Entry::Vacant(entry) => {
                let fresh = self.start(operation, now);
                let handle = (fresh.id, fresh.call.clone());
                entry.insert(fresh);
                handle
            }
        }
    }

    fn start(&self, operation: RestOperation, now: Instant) -> CacheEntry {
        let client = Arc::clone(&self.client);
        let call: BoxFuture<'static, Result<Value, RestError>> =
            async move { client.execute(&operation).await }.boxed();

        CacheEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            created: now,
            call: call.shared(),
        }
    }

    /// Purge if a full TTL has passed since the last sweep
    fn sweep(&self) {
        let now = Instant::now();
        {
            let mut last = self.last_sweep.lock();
            if now < *last + self.ttl {
                return;
            }
            *last = now;
        }
        self.purge();
    }

    /// Drop expired entries
    pub fn purge(&self) {
        let now = Instant::now();
        let before = self.cache.len();
        self.cache.retain(|_, entry| now < entry.created + self.ttl);

        let evicted = before.saturating_sub(self.cache.len());
        if evicted > 0 {
            tracing::trace!(evicted, "REST cache swept");
        }
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}
