//! Process agent
//!
//! Worker-side end of the IPC channel. It is the shards' [`HandshakeGate`] (every
//! Identify waits for a grant from the parent), answers evaluation requests, forwards
//! shard lifecycle events upward, and proxies broadcast evaluations and REST calls
//! through the parent.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use shard_common::WorkerEnv;
use shard_core::{Nonce, NonceGenerator};
use shard_gateway::{GatewayError, HandshakeGate, ShardEvent, ShardManager};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use crate::error::{ClusterError, ClusterResult};
use crate::eval::{EvalContext, Evaluator};
use crate::ipc::{
    ClosePayload, EvalPayload, EvalResult, IpcError, IpcMessage, IpcOp, IpcReader, IpcSender,
    RemoteError, RestPayload, ShardStatePayload,
};
use crate::rest::{RestError, RestOperation};

/// Extra wait on parent round-trips beyond the parent's own per-cluster timeout
const PARENT_REPLY_MARGIN: Duration = Duration::from_secs(2);

/// Worker-side IPC endpoint
pub struct ProcessAgent {
    worker: WorkerEnv,
    sender: IpcSender,
    nonces: NonceGenerator,
    evaluator: Arc<dyn Evaluator>,
    /// Bound on round-trips through the parent, past the parent's own timeout
    request_timeout: Duration,
    manager: OnceLock<Weak<ShardManager>>,

    pending_grants: DashMap<u32, oneshot::Sender<()>>,
    pending_evals: DashMap<Nonce, oneshot::Sender<Vec<EvalResult>>>,
    pending_rest: DashMap<Nonce, oneshot::Sender<RestPayload>>,
}

impl ProcessAgent {
    /// `parent_timeout` is how long the parent waits on each cluster it fans a request
    /// out to; replies are awaited a margin longer so the parent's partial result (with
    /// the timed-out clusters as errors) arrives before this side gives up.
    pub fn new(
        worker: WorkerEnv,
        sender: IpcSender,
        evaluator: Arc<dyn Evaluator>,
        parent_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            worker,
            sender,
            nonces: NonceGenerator::new(worker.cluster_id as u16),
            evaluator,
            request_timeout: parent_timeout + PARENT_REPLY_MARGIN,
            manager: OnceLock::new(),
            pending_grants: DashMap::new(),
            pending_evals: DashMap::new(),
            pending_rest: DashMap::new(),
        })
    }

    /// Give evaluations access to the local shards
    pub fn attach(&self, manager: &Arc<ShardManager>) {
        if self.manager.set(Arc::downgrade(manager)).is_err() {
            tracing::warn!(
                cluster_id = self.worker.cluster_id,
                "Shard manager already attached"
            );
        }
    }

    pub fn worker(&self) -> &WorkerEnv {
        &self.worker
    }

    /// How long a broadcast evaluation or REST call waits for the parent
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Tell the parent this worker has bootstrapped
    pub fn ready(&self) -> ClusterResult<()> {
        self.send(IpcMessage::ready(self.worker.cluster_id))
    }

    /// Ask the parent to restart every cluster, this one included
    pub fn respawn_all(&self) -> ClusterResult<()> {
        self.send(IpcMessage::respawn_all())
    }

    /// Evaluate `code` on every cluster (or only the owner of `shard`)
    ///
    /// One entry per cluster that evaluated; remote failures come back as
    /// [`RemoteError`]s.
    pub async fn broadcast_eval(
        &self,
        code: &str,
        shard: Option<u32>,
    ) -> ClusterResult<Vec<Result<Value, RemoteError>>> {
        let nonce = self.nonces.next();
        let payload = EvalPayload::request(nonce, code, shard);
        let message = IpcMessage::with_payload(IpcOp::Eval, &payload)?.as_request();

        let (tx, rx) = oneshot::channel();
        self.pending_evals.insert(nonce, tx);
        let results = self.round_trip(message, rx, || {
            self.pending_evals.remove(&nonce);
        });

        Ok(results
            .await?
            .into_iter()
            .map(Into::into)
            .collect())
    }

    /// Run a REST operation through the parent's proxy
    pub async fn rest(&self, operation: RestOperation) -> ClusterResult<Value> {
        let nonce = self.nonces.next();
        let payload = RestPayload::request(nonce, operation.method(), operation.args());
        let message = IpcMessage::with_payload(IpcOp::RestRequest, &payload)?.as_request();

        let (tx, rx) = oneshot::channel();
        self.pending_rest.insert(nonce, tx);
        let reply = self
            .round_trip(message, rx, || {
                self.pending_rest.remove(&nonce);
            })
            .await?;

        match reply.error {
            Some(error) => Err(RestError::Remote(error).into()),
            None => Ok(reply.result.unwrap_or(Value::Null)),
        }
    }

    async fn round_trip<T>(
        &self,
        message: IpcMessage,
        rx: oneshot::Receiver<T>,
        forget: impl FnOnce(),
    ) -> ClusterResult<T> {
        if let Err(e) = self.send(message) {
            forget();
            return Err(e);
        }
        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ClusterError::ProcessClosed),
            Err(_) => {
                forget();
                Err(ClusterError::Timeout("parent reply"))
            }
        }
    }

    fn send(&self, message: IpcMessage) -> ClusterResult<()> {
        self.sender
            .send(message.with_cluster(self.worker.cluster_id))
            .map_err(ClusterError::from)
    }

    /// Forward shard lifecycle events to the parent until the bus closes
    pub fn forward_events(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<ShardEvent>,
    ) -> JoinHandle<()> {
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Shard event forwarder lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let message = match event {
                    ShardEvent::StateChanged { shard_id, old, new } => IpcMessage::with_payload(
                        IpcOp::ShardState,
                        &ShardStatePayload {
                            shard_id,
                            old,
                            state: new,
                        },
                    )
                    .map(|m| m.with_shard(shard_id)),
                    ShardEvent::Closed {
                        shard_id,
                        code,
                        reason,
                    } => IpcMessage::with_payload(
                        IpcOp::Close,
                        &ClosePayload {
                            shard_id,
                            code,
                            reason,
                        },
                    )
                    .map(|m| m.with_shard(shard_id)),
                    _ => continue,
                };

                match message {
                    Ok(message) => {
                        if agent.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to encode shard event"),
                }
            }
        })
    }

    /// Read parent messages until the channel closes
    pub async fn serve<R>(self: &Arc<Self>, mut reader: IpcReader<R>)
    where
        R: AsyncRead + Unpin,
    {
        let cluster_id = self.worker.cluster_id;
        loop {
            match reader.next().await {
                Ok(Some(message)) => self.handle_message(message),
                Ok(None) => break,
                Err(IpcError::Deserialization(e)) => {
                    tracing::warn!(cluster_id, error = %e, "Ignoring malformed IPC line");
                }
                Err(e) => {
                    tracing::warn!(cluster_id, error = %e, "IPC read failed");
                    break;
                }
            }
        }

        tracing::info!(cluster_id, "Parent channel closed");
        // Dropping the waiters fails every pending round-trip
        self.pending_grants.clear();
        self.pending_evals.clear();
        self.pending_rest.clear();
    }

    fn handle_message(self: &Arc<Self>, message: IpcMessage) {
        let cluster_id = self.worker.cluster_id;
        tracing::trace!(cluster_id, message = %message, "IPC message received");

        match message.op {
            IpcOp::IdentifyRequest => {
                let granted = message
                    .shard
                    .and_then(|shard_id| self.pending_grants.remove(&shard_id));
                match granted {
                    Some((_, waiter)) => {
                        let _ = waiter.send(());
                    }
                    None => {
                        tracing::debug!(cluster_id, shard = ?message.shard, "Unrequested grant");
                    }
                }
            }
            IpcOp::Eval if message.request => match message.payload::<EvalPayload>() {
                Ok(request) => {
                    let agent = Arc::clone(self);
                    tokio::spawn(async move { agent.answer_eval(request).await });
                }
                Err(e) => tracing::warn!(cluster_id, error = %e, "Bad EVAL request"),
            },
            IpcOp::Eval => match message.payload::<EvalPayload>() {
                Ok(reply) => {
                    if let Some((_, waiter)) = self.pending_evals.remove(&reply.nonce) {
                        let _ = waiter.send(reply.results.unwrap_or_default());
                    }
                }
                Err(e) => tracing::warn!(cluster_id, error = %e, "Bad broadcast EVAL reply"),
            },
            IpcOp::RestRequest if !message.request => match message.payload::<RestPayload>() {
                Ok(reply) => {
                    if let Some((_, waiter)) = self.pending_rest.remove(&reply.nonce) {
                        let _ = waiter.send(reply);
                    }
                }
                Err(e) => tracing::warn!(cluster_id, error = %e, "Bad REST reply"),
            },
            op => tracing::debug!(cluster_id, op = %op, "Ignoring IPC message"),
        }
    }

    async fn answer_eval(&self, request: EvalPayload) {
        let nonce = request.nonce;
        let reply = match request.shard {
            Some(shard_id) if !self.worker.spec().contains(shard_id) => {
                EvalPayload::ignored(nonce)
            }
            _ => {
                let code = request.code.unwrap_or_default();
                match self.evaluator.evaluate(&code, &self.context()).await {
                    Ok(value) => EvalPayload::success(nonce, value),
                    Err(e) => {
                        tracing::debug!(code = %code, error = %e, "Evaluation failed");
                        EvalPayload::failure(nonce, e.to_remote())
                    }
                }
            }
        };

        let sent = IpcMessage::with_payload(IpcOp::Eval, &reply)
            .map_err(ClusterError::from)
            .and_then(|message| self.send(message));
        if let Err(e) = sent {
            tracing::warn!(nonce = %nonce, error = %e, "Failed to send EVAL reply");
        }
    }

    fn context(&self) -> EvalContext {
        let shards = self
            .manager
            .get()
            .and_then(Weak::upgrade)
            .map(|manager| manager.states())
            .unwrap_or_default();
        EvalContext {
            worker: self.worker,
            shards,
        }
    }
}

#[async_trait]
impl HandshakeGate for ProcessAgent {
    async fn acquire(&self, shard_id: u32) -> Result<(), GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.pending_grants.insert(shard_id, tx);

        let request = IpcMessage::identify_request(shard_id).as_request();
        if let Err(e) = self.send(request) {
            self.pending_grants.remove(&shard_id);
            return Err(GatewayError::HandshakeDenied(e.to_string()));
        }

        tracing::debug!(
            cluster_id = self.worker.cluster_id,
            shard_id,
            "Waiting for handshake grant"
        );
        rx.await
            .map_err(|_| GatewayError::HandshakeDenied(ClusterError::ProcessClosed.to_string()))
    }
}
