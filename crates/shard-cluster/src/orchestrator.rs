//! Cluster orchestrator
//!
//! Parent-process coordinator. It computes the shard-to-cluster layout, owns one
//! supervisor per cluster, and routes worker traffic that needs a global view:
//! handshake gating per concurrency group, broadcast evaluation, the REST proxy and
//! whole-deployment respawns.

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use shard_common::{AppConfig, ShardCount, ShardingConfig};
use shard_core::{concurrency_group, ClusterLayout, CoreError, ShardState};
use shard_gateway::{EventBus, QueueRegistry, QueueTask};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{ClusterError, ClusterResult};
use crate::events::ClusterEvent;
use crate::ipc::{
    ClosePayload, EvalOutcome, EvalPayload, EvalResult, IpcError, IpcMessage, IpcOp,
    RemoteError, RestPayload, ShardStatePayload,
};
use crate::rest::{gateway_bot, RestClient, RestOperation, RestProxy};
use crate::supervisor::{Inbound, ProcessSupervisor, SupervisorConfig, WorkerLauncher};

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Shards per handshake concurrency group stride
    pub max_concurrency: u32,
    /// Minimum gap between handshakes of one group
    pub identify_spacing: Duration,
    /// How long a granted shard may take to reach CONNECTED
    pub handshake_timeout: Duration,
    /// Idle time after which a group queue is dropped
    pub queue_expire: Duration,
    pub rest_cache_ttl: Duration,
    pub supervisor: SupervisorConfig,
}

impl OrchestratorConfig {
    pub fn from_app_config(config: &AppConfig, max_concurrency: u32) -> Self {
        let timing = &config.timing;
        Self {
            max_concurrency: max_concurrency.max(1),
            identify_spacing: timing.identify_spacing(),
            handshake_timeout: timing.handshake_timeout(),
            queue_expire: timing.queue_expire(),
            rest_cache_ttl: timing.rest_cache_ttl(),
            supervisor: SupervisorConfig::from_config(timing, &config.cluster),
        }
    }
}

/// Resolve the layout and handshake concurrency, asking the gateway where configured
/// values are missing
pub async fn resolve_layout(
    sharding: &ShardingConfig,
    rest: &dyn RestClient,
) -> ClusterResult<(ClusterLayout, u32)> {
    let needs_gateway =
        sharding.total_shards == ShardCount::Auto || sharding.max_concurrency.is_none();
    let recommended = if needs_gateway {
        let info = gateway_bot(rest).await?;
        tracing::info!(
            shards = info.shards,
            max_concurrency = info.session_start_limit.max_concurrency,
            remaining = info.session_start_limit.remaining,
            "Gateway recommendation received"
        );
        Some(info)
    } else {
        None
    };

    let total_shards = match (sharding.total_shards, &recommended) {
        (ShardCount::Fixed(n), _) => n,
        (ShardCount::Auto, Some(info)) => info.shards,
        (ShardCount::Auto, None) => return Err(CoreError::NoShards.into()),
    };
    let max_concurrency = sharding
        .max_concurrency
        .or_else(|| {
            recommended
                .as_ref()
                .map(|info| info.session_start_limit.max_concurrency)
        })
        .unwrap_or(1)
        .max(1);

    let first = sharding.first_shard.unwrap_or(0);
    let last = sharding
        .last_shard
        .unwrap_or_else(|| total_shards.saturating_sub(1));
    let layout = ClusterLayout::compute(first, last, total_shards, sharding.cluster_count)?;

    Ok((layout, max_concurrency))
}

/// Parent-side coordinator of every cluster
pub struct ClusterOrchestrator {
    layout: ClusterLayout,
    config: OrchestratorConfig,
    supervisors: Vec<Arc<ProcessSupervisor>>,
    /// Handshake queues keyed by concurrency group
    queues: Arc<QueueRegistry<u32>>,
    rest: RestProxy,
    /// Last reported state of every shard
    shard_states: DashMap<u32, ShardState>,
    events: EventBus<ClusterEvent>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterOrchestrator {
    pub fn new(
        layout: ClusterLayout,
        config: OrchestratorConfig,
        launcher: Arc<dyn WorkerLauncher>,
        rest: Arc<dyn RestClient>,
    ) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let events = EventBus::new();

        let supervisors = layout
            .clusters()
            .iter()
            .map(|spec| {
                ProcessSupervisor::new(
                    *spec,
                    layout.cluster_count(),
                    Arc::clone(&launcher),
                    config.supervisor.clone(),
                    inbound_tx.clone(),
                    events.clone(),
                )
            })
            .collect();

        Arc::new(Self {
            queues: QueueRegistry::new(config.queue_expire),
            rest: RestProxy::new(rest, config.rest_cache_ttl),
            layout,
            config,
            supervisors,
            shard_states: DashMap::new(),
            events,
            inbound: Mutex::new(Some(inbound_rx)),
            router: Mutex::new(None),
        })
    }

    /// Build from configuration, querying the gateway for automatic values
    pub async fn from_app_config(
        config: &AppConfig,
        launcher: Arc<dyn WorkerLauncher>,
        rest: Arc<dyn RestClient>,
    ) -> ClusterResult<Arc<Self>> {
        let (layout, max_concurrency) = resolve_layout(&config.sharding, rest.as_ref()).await?;
        tracing::info!(
            total_shards = layout.total_shards(),
            clusters = layout.cluster_count(),
            max_concurrency,
            "Cluster layout computed"
        );
        Ok(Self::new(
            layout,
            OrchestratorConfig::from_app_config(config, max_concurrency),
            launcher,
            rest,
        ))
    }

    pub fn layout(&self) -> &ClusterLayout {
        &self.layout
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus<ClusterEvent> {
        &self.events
    }

    pub fn supervisors(&self) -> &[Arc<ProcessSupervisor>] {
        &self.supervisors
    }

    pub fn supervisor(&self, cluster_id: u32) -> ClusterResult<&Arc<ProcessSupervisor>> {
        self.supervisors
            .get(cluster_id as usize)
            .ok_or(ClusterError::UnknownCluster(cluster_id))
    }

    /// Last state a shard reported, if any
    pub fn shard_state(&self, shard_id: u32) -> Option<ShardState> {
        self.shard_states.get(&shard_id).map(|s| *s)
    }

    /// Start routing worker traffic and spawn every cluster in order
    ///
    /// Each spawn waits for the worker's READY before the next cluster starts.
    pub async fn start(self: &Arc<Self>) -> ClusterResult<()> {
        let inbound = self.inbound.lock().take();
        if let Some(inbound) = inbound {
            let router = tokio::spawn(Self::route_loop(Arc::downgrade(self), inbound));
            *self.router.lock() = Some(router);
        }

        for supervisor in &self.supervisors {
            supervisor.spawn().await?;
        }
        tracing::info!(clusters = self.supervisors.len(), "All clusters spawned");
        Ok(())
    }

    /// Kill every worker and stop routing
    pub async fn shutdown(&self) {
        for supervisor in &self.supervisors {
            supervisor.kill();
        }
        join_all(self.supervisors.iter().map(|s| s.wait_stopped())).await;

        if let Some(router) = self.router.lock().take() {
            router.abort();
        }
        tracing::info!("Cluster shut down");
    }

    /// Restart every cluster, one after another
    pub async fn respawn_all(&self) -> ClusterResult<()> {
        tracing::info!(clusters = self.supervisors.len(), "Respawning all clusters");
        for supervisor in &self.supervisors {
            supervisor.respawn().await?;
        }
        Ok(())
    }

    /// Evaluate `code` on every cluster (or only the owner of `shard`)
    pub async fn broadcast_eval(
        &self,
        code: &str,
        shard: Option<u32>,
    ) -> Vec<Result<Value, RemoteError>> {
        self.gather_eval(code, shard)
            .await
            .into_iter()
            .map(Into::into)
            .collect()
    }

    /// Evaluate `code` on one cluster
    pub async fn eval_on(&self, cluster_id: u32, code: &str) -> ClusterResult<Value> {
        match self.supervisor(cluster_id)?.eval(code, None, None).await? {
            EvalOutcome::Value(value) => Ok(value),
            EvalOutcome::Failed(error) => Err(error.into()),
            EvalOutcome::Ignored => Ok(Value::Null),
        }
    }

    async fn gather_eval(&self, code: &str, shard: Option<u32>) -> Vec<EvalResult> {
        let replies = join_all(
            self.supervisors
                .iter()
                .map(|supervisor| supervisor.eval(code, shard, None)),
        )
        .await;

        replies
            .into_iter()
            .zip(&self.supervisors)
            .filter_map(|(reply, supervisor)| match reply {
                Ok(outcome) => outcome.into_result(),
                Err(e) => {
                    tracing::warn!(cluster_id = supervisor.id(), error = %e, "Evaluation failed");
                    Some(EvalResult::Err {
                        error: e.to_remote(),
                    })
                }
            })
            .collect()
    }

    /// Queue a handshake for `shard_id` on its concurrency group
    ///
    /// The queued task grants the owning worker permission, waits (bounded by the
    /// handshake timeout) for the shard to connect, then holds the group for the
    /// identify spacing.
    pub fn request_identify(&self, shard_id: u32) -> ClusterResult<()> {
        let supervisor = self
            .layout
            .cluster_for_shard(shard_id)
            .and_then(|spec| self.supervisors.get(spec.id as usize))
            .cloned()
            .ok_or(CoreError::ShardOutOfRange {
                shard_id,
                total: self.layout.total_shards(),
            })?;
        let group = concurrency_group(shard_id, self.config.max_concurrency)?;

        let queues = Arc::clone(&self.queues);
        let timeout = self.config.handshake_timeout;
        let spacing = self.config.identify_spacing;

        let task: QueueTask = Box::pin(async move {
            let cluster_id = supervisor.id();
            match supervisor.grant_identify(shard_id, timeout).await {
                Ok(()) => tracing::debug!(cluster_id, shard_id, group, "Shard connected"),
                Err(e) => {
                    tracing::warn!(
                        cluster_id,
                        shard_id,
                        group,
                        error = %e,
                        "Handshake not confirmed"
                    );
                }
            }
            queues.lock(&group, spacing);
        });

        tracing::debug!(shard_id, group, "Handshake queued");
        self.queues.enqueue(&group, task, false);
        Ok(())
    }

    async fn route_loop(this: Weak<Self>, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
        while let Some(inbound) = inbound.recv().await {
            let Some(orchestrator) = this.upgrade() else {
                break;
            };
            orchestrator.route(inbound);
        }
    }

    fn route(self: &Arc<Self>, inbound: Inbound) {
        let Inbound {
            cluster_id,
            message,
        } = inbound;

        match message.op {
            IpcOp::IdentifyRequest => match message.shard {
                Some(shard_id) => {
                    if let Err(e) = self.request_identify(shard_id) {
                        tracing::warn!(
                            cluster_id,
                            shard_id,
                            error = %e,
                            "Rejected handshake request"
                        );
                    }
                }
                None => tracing::warn!(cluster_id, "IDENTIFY_REQUEST without shard"),
            },
            IpcOp::Eval if message.request => match message.payload::<EvalPayload>() {
                Ok(request) => {
                    let this = Arc::clone(self);
                    tokio::spawn(async move { this.answer_broadcast(cluster_id, request).await });
                }
                Err(e) => tracing::warn!(cluster_id, error = %e, "Bad broadcast EVAL request"),
            },
            IpcOp::RestRequest if message.request => match message.payload::<RestPayload>() {
                Ok(request) => {
                    let this = Arc::clone(self);
                    tokio::spawn(async move { this.answer_rest(cluster_id, request).await });
                }
                Err(e) => tracing::warn!(cluster_id, error = %e, "Bad REST request"),
            },
            IpcOp::RespawnAll => {
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = this.respawn_all().await {
                        tracing::error!(error = %e, "Respawn of all clusters failed");
                    }
                });
            }
            IpcOp::ShardState => match message.payload::<ShardStatePayload>() {
                Ok(change) => {
                    tracing::debug!(
                        cluster_id,
                        shard_id = change.shard_id,
                        old = %change.old,
                        new = %change.state,
                        "Shard state changed"
                    );
                    self.shard_states.insert(change.shard_id, change.state);
                    self.events.publish(ClusterEvent::ShardState {
                        cluster_id,
                        shard_id: change.shard_id,
                        old: change.old,
                        new: change.state,
                    });
                }
                Err(e) => tracing::warn!(cluster_id, error = %e, "Bad SHARD_STATE payload"),
            },
            IpcOp::Close => match message.payload::<ClosePayload>() {
                Ok(close) => {
                    tracing::info!(
                        cluster_id,
                        shard_id = close.shard_id,
                        code = ?close.code,
                        reason = %close.reason,
                        "Shard closed"
                    );
                    self.events.publish(ClusterEvent::ShardClosed {
                        cluster_id,
                        shard_id: close.shard_id,
                        code: close.code,
                        reason: close.reason,
                    });
                }
                Err(e) => tracing::warn!(cluster_id, error = %e, "Bad CLOSE payload"),
            },
            op => tracing::debug!(cluster_id, op = %op, "Unrouted IPC message"),
        }
    }

    async fn answer_broadcast(&self, cluster_id: u32, request: EvalPayload) {
        let code = request.code.unwrap_or_default();
        let results = self.gather_eval(&code, request.shard).await;
        self.reply(
            cluster_id,
            IpcMessage::with_payload(IpcOp::Eval, &EvalPayload::broadcast(request.nonce, results)),
        );
    }

    async fn answer_rest(&self, cluster_id: u32, request: RestPayload) {
        let outcome = match RestOperation::parse(&request.method, &request.args) {
            Ok(operation) => self.rest.execute(operation).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &outcome {
            tracing::warn!(
                cluster_id,
                method = %request.method,
                error = %e,
                "Proxied REST request failed"
            );
        }

        let reply = RestPayload::reply(request.nonce, outcome.map_err(|e| e.to_remote()));
        self.reply(
            cluster_id,
            IpcMessage::with_payload(IpcOp::RestRequest, &reply),
        );
    }

    fn reply(&self, cluster_id: u32, message: Result<IpcMessage, IpcError>) {
        let sent = message
            .map_err(ClusterError::from)
            .and_then(|message| self.supervisor(cluster_id)?.send(message));
        if let Err(e) = sent {
            tracing::warn!(cluster_id, error = %e, "Failed to deliver reply");
        }
    }
}
