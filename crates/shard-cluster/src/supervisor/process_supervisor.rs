//! Process supervisor
//!
//! Parent-side owner of one worker process. It launches the worker, waits for READY,
//! correlates evaluation replies and handshake grants, forwards everything else to its
//! owner, and re-spawns the worker when it exits unexpectedly.

use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use shard_common::{ClusterConfig, TimingConfig, WorkerEnv};
use shard_core::{ClusterSpec, Nonce, NonceGenerator, ShardState};
use shard_gateway::EventBus;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

use super::{WorkerLauncher, WorkerProcess};
use crate::error::{ClusterError, ClusterResult};
use crate::events::ClusterEvent;
use crate::ipc::{
    EvalOutcome, EvalPayload, IpcError, IpcMessage, IpcOp, IpcReader, IpcSender,
    ShardStatePayload,
};

/// Supervision settings
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Re-spawn a worker that exits without being asked to
    pub respawn: bool,
    /// Pause before an automatic re-spawn
    pub respawn_delay: Duration,
    /// Bound on the wait for READY; `None` waits indefinitely
    pub spawn_timeout: Option<Duration>,
    /// Default bound on evaluation round-trips
    pub eval_timeout: Duration,
}

impl SupervisorConfig {
    pub fn from_config(timing: &TimingConfig, cluster: &ClusterConfig) -> Self {
        Self {
            respawn: cluster.respawn,
            respawn_delay: Duration::from_millis(500),
            spawn_timeout: timing.spawn_timeout(),
            eval_timeout: timing.eval_timeout(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from_config(
            &TimingConfig::default(),
            &ClusterConfig {
                respawn: true,
                worker_path: None,
            },
        )
    }
}

/// Worker process status as seen by the parent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Stopped,
    /// Launched, READY not yet received
    Starting,
    Ready,
}

/// A worker message the supervisor does not handle itself
#[derive(Debug, Clone)]
pub struct Inbound {
    pub cluster_id: u32,
    pub message: IpcMessage,
}

struct Live {
    generation: u64,
    pid: Option<u32>,
    sender: IpcSender,
    kill: Option<oneshot::Sender<()>>,
    ready: Option<oneshot::Sender<()>>,
}

type EvalReply = oneshot::Sender<Result<EvalPayload, ClusterError>>;
type GrantReply = oneshot::Sender<Result<(), ClusterError>>;

/// Parent-side handle of one cluster's worker process
pub struct ProcessSupervisor {
    spec: ClusterSpec,
    cluster_count: u32,
    launcher: Arc<dyn WorkerLauncher>,
    config: SupervisorConfig,
    nonces: NonceGenerator,

    live: Mutex<Option<Live>>,
    generation: AtomicU64,
    /// Set by `kill`/`respawn` so the exit is not treated as a crash
    stop_requested: AtomicBool,
    status: watch::Sender<ProcessStatus>,

    /// Outstanding evaluations by nonce
    pending_evals: DashMap<Nonce, EvalReply>,
    /// Outstanding handshake grants by shard id
    pending_grants: DashMap<u32, GrantReply>,

    inbound: mpsc::UnboundedSender<Inbound>,
    events: EventBus<ClusterEvent>,
}

impl ProcessSupervisor {
    pub fn new(
        spec: ClusterSpec,
        cluster_count: u32,
        launcher: Arc<dyn WorkerLauncher>,
        config: SupervisorConfig,
        inbound: mpsc::UnboundedSender<Inbound>,
        events: EventBus<ClusterEvent>,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(ProcessStatus::Stopped);
        Arc::new(Self {
            spec,
            cluster_count,
            launcher,
            config,
            nonces: NonceGenerator::for_parent(),
            live: Mutex::new(None),
            generation: AtomicU64::new(0),
            stop_requested: AtomicBool::new(false),
            status,
            pending_evals: DashMap::new(),
            pending_grants: DashMap::new(),
            inbound,
            events,
        })
    }

    pub fn id(&self) -> u32 {
        self.spec.id
    }

    pub fn spec(&self) -> &ClusterSpec {
        &self.spec
    }

    pub fn status(&self) -> ProcessStatus {
        *self.status.borrow()
    }

    pub fn status_changes(&self) -> watch::Receiver<ProcessStatus> {
        self.status.subscribe()
    }

    pub fn pid(&self) -> Option<u32> {
        self.live.lock().as_ref().and_then(|live| live.pid)
    }

    pub fn pending_evals(&self) -> usize {
        self.pending_evals.len()
    }

    pub fn pending_grants(&self) -> usize {
        self.pending_grants.len()
    }

    /// Launch the worker and wait for its READY
    ///
    /// When the spawn timeout elapses first the worker is killed and not re-spawned.
    pub async fn spawn(self: &Arc<Self>) -> ClusterResult<()> {
        let cluster_id = self.id();
        if self.live.lock().is_some() {
            return Err(ClusterError::Spawn {
                cluster_id,
                reason: "worker already running".to_string(),
            });
        }

        self.stop_requested.store(false, Ordering::Release);
        let env = WorkerEnv::for_cluster(&self.spec, self.cluster_count);
        let WorkerProcess {
            input,
            output,
            mut control,
        } = self.launcher.launch(&env).await?;

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let pid = control.pid();
        let (sender, _writer) = IpcSender::spawn(input);
        let (kill_tx, kill_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        *self.live.lock() = Some(Live {
            generation,
            pid,
            sender,
            kill: Some(kill_tx),
            ready: Some(ready_tx),
        });
        self.status.send_replace(ProcessStatus::Starting);
        self.events.publish(ClusterEvent::Spawned { cluster_id, pid });
        tracing::info!(cluster_id, pid = ?pid, generation, "Worker spawned");

        let reader = Arc::clone(self);
        tokio::spawn(async move {
            reader.read_loop(generation, IpcReader::new(output)).await;
        });

        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let code = tokio::select! {
                code = control.wait() => code,
                Ok(()) = kill_rx => {
                    control.kill().await;
                    None
                }
            };
            monitor.on_exit(generation, code);
        });

        let ready = match self.config.spawn_timeout {
            Some(limit) => match tokio::time::timeout(limit, ready_rx).await {
                Ok(ready) => ready,
                Err(_) => {
                    tracing::warn!(
                        cluster_id,
                        limit_ms = limit.as_millis(),
                        "Worker not ready in time, killing"
                    );
                    self.kill();
                    return Err(ClusterError::Timeout("READY"));
                }
            },
            None => ready_rx.await,
        };
        ready.map_err(|_| ClusterError::ProcessClosed)
    }

    /// Kill the worker without re-spawning it; `false` if none was running
    pub fn kill(&self) -> bool {
        self.stop_requested.store(true, Ordering::Release);
        let kill = self.live.lock().as_mut().and_then(|live| live.kill.take());
        match kill {
            Some(kill) => {
                tracing::info!(cluster_id = self.id(), "Killing worker");
                let _ = kill.send(());
                true
            }
            None => false,
        }
    }

    /// Wait until no worker process is running
    pub async fn wait_stopped(&self) {
        let mut status = self.status.subscribe();
        let _ = status.wait_for(|s| *s == ProcessStatus::Stopped).await;
    }

    /// Kill the current worker, wait for it to exit, and spawn a fresh one
    pub async fn respawn(self: &Arc<Self>) -> ClusterResult<()> {
        if self.kill() {
            self.wait_stopped().await;
        }
        self.spawn().await
    }

    /// Send a message to the worker
    pub fn send(&self, message: IpcMessage) -> ClusterResult<()> {
        let live = self.live.lock();
        let live = live.as_ref().ok_or(ClusterError::NotRunning(self.id()))?;
        live.sender
            .send(message.with_cluster(self.spec.id))
            .map_err(ClusterError::from)
    }

    /// Evaluate `code` in the worker
    ///
    /// With `shard` set, only the cluster owning that shard evaluates and the others
    /// answer [`EvalOutcome::Ignored`].
    pub async fn eval(
        &self,
        code: &str,
        shard: Option<u32>,
        timeout: Option<Duration>,
    ) -> ClusterResult<EvalOutcome> {
        let nonce = self.nonces.next();
        let payload = EvalPayload::request(nonce, code, shard);
        let message = IpcMessage::with_payload(IpcOp::Eval, &payload)?.as_request();

        let (tx, rx) = oneshot::channel();
        self.pending_evals.insert(nonce, tx);
        if let Err(e) = self.send(message) {
            self.pending_evals.remove(&nonce);
            return Err(e);
        }

        let limit = timeout.unwrap_or(self.config.eval_timeout);
        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(reply)) => reply.map(EvalPayload::outcome),
            Ok(Err(_)) => Err(ClusterError::ProcessClosed),
            Err(_) => {
                self.pending_evals.remove(&nonce);
                Err(ClusterError::Timeout("EVAL reply"))
            }
        }
    }

    /// Let `shard_id` identify, then wait for it to report CONNECTED
    pub async fn grant_identify(&self, shard_id: u32, timeout: Duration) -> ClusterResult<()> {
        let (tx, rx) = oneshot::channel();
        self.pending_grants.insert(shard_id, tx);
        if let Err(e) = self.send(IpcMessage::identify_request(shard_id)) {
            self.pending_grants.remove(&shard_id);
            return Err(e);
        }
        tracing::debug!(cluster_id = self.id(), shard_id, "Handshake granted");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClusterError::ProcessClosed),
            Err(_) => {
                self.pending_grants.remove(&shard_id);
                Err(ClusterError::Timeout("shard to connect"))
            }
        }
    }

    async fn read_loop<R>(&self, generation: u64, mut reader: IpcReader<R>)
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let cluster_id = self.id();
        loop {
            match reader.next().await {
                Ok(Some(message)) => self.handle_message(generation, message),
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
        tracing::debug!(cluster_id, generation, "IPC channel closed");
    }

    fn handle_message(&self, generation: u64, message: IpcMessage) {
        let cluster_id = self.id();
        tracing::trace!(cluster_id, message = %message, "IPC message received");

        match message.op {
            IpcOp::Ready => {
                let ready = self
                    .live
                    .lock()
                    .as_mut()
                    .filter(|live| live.generation == generation)
                    .and_then(|live| live.ready.take());
                if let Some(ready) = ready {
                    let _ = ready.send(());
                }
                self.status.send_replace(ProcessStatus::Ready);
                self.events.publish(ClusterEvent::Ready { cluster_id });
                tracing::info!(cluster_id, "Worker ready");
                return;
            }
            IpcOp::Eval if !message.request => {
                match message.payload::<EvalPayload>() {
                    Ok(reply) => match self.pending_evals.remove(&reply.nonce) {
                        Some((_, waiter)) => {
                            let _ = waiter.send(Ok(reply));
                        }
                        None => {
                            tracing::debug!(
                                cluster_id,
                                nonce = %reply.nonce,
                                minted = %reply.nonce.created_at(),
                                "Late EVAL reply dropped"
                            );
                        }
                    },
                    Err(e) => tracing::warn!(cluster_id, error = %e, "Bad EVAL reply"),
                }
                return;
            }
            IpcOp::ShardState => match message.payload::<ShardStatePayload>() {
                Ok(change) if change.state == ShardState::Connected => {
                    if let Some((_, waiter)) = self.pending_grants.remove(&change.shard_id) {
                        let _ = waiter.send(Ok(()));
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(cluster_id, error = %e, "Bad SHARD_STATE payload"),
            },
            _ => {}
        }

        let _ = self.inbound.send(Inbound {
            cluster_id,
            message: message.with_cluster(cluster_id),
        });
    }

    fn on_exit(self: &Arc<Self>, generation: u64, code: Option<i32>) {
        let cluster_id = self.id();
        {
            let mut live = self.live.lock();
            if live.as_ref().map(|l| l.generation) != Some(generation) {
                return;
            }
            // Dropping the pipe and the READY sender fails any waiting spawn
            live.take();
        }
        self.status.send_replace(ProcessStatus::Stopped);
        let rejected = self.reject_pending();

        let respawning = self.config.respawn && !self.stop_requested.load(Ordering::Acquire);
        if respawning || code.is_some_and(|c| c != 0) {
            tracing::warn!(cluster_id, code = ?code, rejected, respawning, "Worker exited");
        } else {
            tracing::info!(cluster_id, code = ?code, rejected, "Worker stopped");
        }
        self.events.publish(ClusterEvent::Exited {
            cluster_id,
            code,
            respawning,
        });

        if respawning {
            tokio::spawn(Arc::clone(self).respawn_after(self.config.respawn_delay));
        }
    }

    fn respawn_after(self: Arc<Self>, delay: Duration) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            if self.stop_requested.load(Ordering::Acquire) || self.live.lock().is_some() {
                return;
            }
            if let Err(e) = self.spawn().await {
                tracing::error!(cluster_id = self.id(), error = %e, "Worker respawn failed");
            }
        })
    }

    /// Fail every outstanding evaluation and grant with `ProcessClosed`
    fn reject_pending(&self) -> usize {
        let nonces: Vec<Nonce> = self.pending_evals.iter().map(|e| *e.key()).collect();
        let shards: Vec<u32> = self.pending_grants.iter().map(|e| *e.key()).collect();
        let mut rejected = 0;

        for nonce in nonces {
            if let Some((_, waiter)) = self.pending_evals.remove(&nonce) {
                let _ = waiter.send(Err(ClusterError::ProcessClosed));
                rejected += 1;
            }
        }
        for shard_id in shards {
            if let Some((_, waiter)) = self.pending_grants.remove(&shard_id) {
                let _ = waiter.send(Err(ClusterError::ProcessClosed));
                rejected += 1;
            }
        }
        rejected
    }
}
