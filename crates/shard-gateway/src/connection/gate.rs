//! Handshake gate
//!
//! A shard asks the gate before every Identify. In a clustered deployment the gate is
//! the worker's IPC agent, which forwards the request to the parent's concurrency-group
//! queue; standalone shards use [`ImmediateGate`] or [`SpacedGate`].

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::error::GatewayError;
use crate::queue::QueueRegistry;

/// Permission source for new-session handshakes
#[async_trait]
pub trait HandshakeGate: Send + Sync {
    /// Resolve once `shard_id` may send Identify
    async fn acquire(&self, shard_id: u32) -> Result<(), GatewayError>;
}

/// Grants every request at once
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateGate;

#[async_trait]
impl HandshakeGate for ImmediateGate {
    async fn acquire(&self, _shard_id: u32) -> Result<(), GatewayError> {
        Ok(())
    }
}

/// In-process gate: one grant per concurrency group every `spacing`
#[derive(Debug)]
pub struct SpacedGate {
    queues: Arc<QueueRegistry<u32>>,
    max_concurrency: u32,
    spacing: Duration,
}

impl SpacedGate {
    pub fn new(max_concurrency: u32, spacing: Duration) -> Self {
        Self {
            queues: QueueRegistry::new(spacing.saturating_mul(2)),
            max_concurrency: max_concurrency.max(1),
            spacing,
        }
    }
}

#[async_trait]
impl HandshakeGate for SpacedGate {
    async fn acquire(&self, shard_id: u32) -> Result<(), GatewayError> {
        let group = shard_id % self.max_concurrency;
        let (tx, rx) = oneshot::channel();
        let queues = Arc::clone(&self.queues);
        let spacing = self.spacing;

        self.queues.enqueue(
            &group,
            Box::pin(async move {
                if tx.send(()).is_ok() {
                    queues.lock(&group, spacing);
                }
            }),
            false,
        );

        rx.await
            .map_err(|_| GatewayError::HandshakeDenied("gate dropped".to_string()))
    }
}
