//! Outbound send budget
//!
//! The gateway allows a fixed number of frames per window per connection. Every written
//! frame is recorded here. Application frames may only use the budget minus a small
//! reserve; once they have spent their share the caller locks the shard's queue until the
//! window rolls over. Heartbeat, identify and resume frames draw on the reserve and are
//! never held back.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// One reserved slot per this many frames of budget (at least one)
const RESERVE_RATIO: u32 = 40;

#[derive(Debug)]
pub struct SendBudget {
    limit: u32,
    /// Slots only control frames may use
    reserved: u32,
    window: Duration,
    /// (window start, frames sent in window)
    usage: Mutex<(Instant, u32)>,
}

impl SendBudget {
    pub fn new(limit: u32, window: Duration) -> Self {
        let limit = limit.max(2);
        Self {
            limit,
            reserved: (limit / RESERVE_RATIO).clamp(1, limit - 1),
            window,
            usage: Mutex::new((Instant::now(), 0)),
        }
    }

    /// Record one application frame; returns how long to pause when their share is spent
    pub fn record_application(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut usage = self.usage.lock();
        let used = self.count(&mut usage, now);

        (used >= self.limit - self.reserved)
            .then(|| self.window.saturating_sub(now.saturating_duration_since(usage.0)))
    }

    /// Record one heartbeat, identify or resume frame
    pub fn record_control(&self) {
        let now = Instant::now();
        let used = self.count(&mut self.usage.lock(), now);
        if used > self.limit {
            tracing::warn!(used, limit = self.limit, "Control frames exceeded the send budget");
        }
    }

    /// Start a fresh window; a new socket has its own budget
    pub fn reset(&self) {
        *self.usage.lock() = (Instant::now(), 0);
    }

    /// Frames left in the current window, reserve included
    pub fn remaining(&self) -> u32 {
        let usage = self.usage.lock();
        if Instant::now().saturating_duration_since(usage.0) >= self.window {
            return self.limit;
        }
        self.limit.saturating_sub(usage.1)
    }

    fn count(&self, usage: &mut (Instant, u32), now: Instant) -> u32 {
        if now.saturating_duration_since(usage.0) >= self.window {
            *usage = (now, 0);
        }
        usage.1 += 1;
        usage.1
    }
}
