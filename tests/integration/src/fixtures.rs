//! Test fixtures
//!
//! Configurations tuned for fast tests, worker launchers that stay inside the test
//! process, and a stub REST client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use shard_cluster::ipc::{IpcReader, IpcSender};
use shard_cluster::supervisor::WorkerControl;
use shard_cluster::{
    BuiltinEvaluator, ClusterError, ClusterResult, EvalContext, EvalError, Evaluator, IpcMessage,
    IpcOp, ProcessAgent, RestClient, RestError, RestOperation, Worker, WorkerLauncher,
    WorkerProcess,
};
use shard_common::{AppConfig, WorkerEnv};
use shard_gateway::{SessionConfig, ShardConfig};
use tokio::io::{DuplexStream, ReadHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};

use crate::helpers::TEST_TIMEOUT;

pub const TEST_TOKEN: &str = "test-token";

/// Gateway address that refuses connections; shards pointed at it sit in backoff
pub const UNREACHABLE_GATEWAY: &str = "ws://127.0.0.1:9";

/// Application config with fast reconnects plus `overrides`
pub fn app_config(gateway_url: &str, overrides: &[(&str, &str)]) -> Result<AppConfig> {
    let mut vars: HashMap<String, String> = [
        ("BOT_TOKEN", TEST_TOKEN),
        ("GATEWAY_URL", gateway_url),
        ("RECONNECT_BASE_MS", "10"),
        ("RECONNECT_MAX_MS", "50"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    for (key, value) in overrides {
        vars.insert((*key).to_string(), (*value).to_string());
    }

    AppConfig::from_lookup(|name| vars.get(name).cloned())
        .map_err(|e| anyhow!("Config error: {e}"))
}

/// Shard settings with fast reconnects
pub fn shard_config(gateway_url: &str) -> ShardConfig {
    let mut config = ShardConfig::new(gateway_url, SessionConfig::new(TEST_TOKEN, 513));
    config.reconnect_base = Duration::from_millis(10);
    config.reconnect_max = Duration::from_millis(50);
    config
}

/// Runs each worker as a task over an in-memory pipe
pub struct InProcessLauncher {
    config: AppConfig,
    evaluator: Arc<dyn Evaluator>,
    running: Mutex<HashMap<u32, AbortHandle>>,
    agents: Mutex<HashMap<u32, Arc<ProcessAgent>>>,
    launches: AtomicU32,
}

impl InProcessLauncher {
    pub fn new(config: AppConfig, evaluator: Arc<dyn Evaluator>) -> Arc<Self> {
        Arc::new(Self {
            config,
            evaluator,
            running: Mutex::new(HashMap::new()),
            agents: Mutex::new(HashMap::new()),
            launches: AtomicU32::new(0),
        })
    }

    /// Abort a worker as if its process died
    pub fn crash(&self, cluster_id: u32) -> bool {
        match self.running.lock().remove(&cluster_id) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    pub fn launches(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }

    /// IPC endpoint of the latest worker launched for `cluster_id`
    pub fn agent(&self, cluster_id: u32) -> Option<Arc<ProcessAgent>> {
        self.agents.lock().get(&cluster_id).cloned()
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(&self, env: &WorkerEnv) -> Result<WorkerProcess, ClusterError> {
        let (parent, child) = tokio::io::duplex(64 * 1024);
        let (parent_read, parent_write) = tokio::io::split(parent);
        let (child_read, child_write) = tokio::io::split(child);

        let worker = Worker::new(&self.config, *env, child_write, Arc::clone(&self.evaluator));
        self.agents
            .lock()
            .insert(env.cluster_id, Arc::clone(worker.agent()));
        let task = tokio::spawn(worker.run(child_read));

        self.running.lock().insert(env.cluster_id, task.abort_handle());
        self.launches.fetch_add(1, Ordering::SeqCst);

        Ok(WorkerProcess {
            input: Box::new(parent_write),
            output: Box::new(parent_read),
            control: Box::new(TaskControl { task }),
        })
    }
}

struct TaskControl {
    task: JoinHandle<ClusterResult<()>>,
}

#[async_trait]
impl WorkerControl for TaskControl {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self) -> Option<i32> {
        match (&mut self.task).await {
            Ok(Ok(())) => Some(0),
            Ok(Err(_)) => Some(1),
            Err(_) => None,
        }
    }

    async fn kill(&mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
    }
}

/// Built-in evaluator that never answers on one cluster
pub struct StallingEvaluator {
    stalled_cluster: u32,
    inner: BuiltinEvaluator,
}

impl StallingEvaluator {
    pub fn new(stalled_cluster: u32) -> Arc<Self> {
        Arc::new(Self {
            stalled_cluster,
            inner: BuiltinEvaluator::new(),
        })
    }
}

#[async_trait]
impl Evaluator for StallingEvaluator {
    async fn evaluate(&self, code: &str, context: &EvalContext) -> Result<Value, EvalError> {
        if context.worker.cluster_id == self.stalled_cluster {
            std::future::pending::<()>().await;
        }
        self.inner.evaluate(code, context).await
    }
}

/// Hands every launched worker's pipe to the test, which plays the worker
pub struct ScriptedLauncher {
    workers: mpsc::UnboundedSender<ScriptedWorker>,
}

impl ScriptedLauncher {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ScriptedWorker>) {
        let (workers, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { workers }), rx)
    }
}

#[async_trait]
impl WorkerLauncher for ScriptedLauncher {
    async fn launch(&self, env: &WorkerEnv) -> Result<WorkerProcess, ClusterError> {
        let (parent, child) = tokio::io::duplex(64 * 1024);
        let (parent_read, parent_write) = tokio::io::split(parent);
        let (child_read, child_write) = tokio::io::split(child);
        let (exit_tx, exit_rx) = oneshot::channel();

        let (sender, _writer) = IpcSender::spawn(child_write);
        let worker = ScriptedWorker {
            env: *env,
            reader: IpcReader::new(child_read),
            sender,
            exit: Some(exit_tx),
        };
        self.workers.send(worker).map_err(|_| ClusterError::Spawn {
            cluster_id: env.cluster_id,
            reason: "test stopped accepting workers".to_string(),
        })?;

        Ok(WorkerProcess {
            input: Box::new(parent_write),
            output: Box::new(parent_read),
            control: Box::new(ScriptedControl { exit: exit_rx }),
        })
    }
}

struct ScriptedControl {
    exit: oneshot::Receiver<i32>,
}

#[async_trait]
impl WorkerControl for ScriptedControl {
    fn pid(&self) -> Option<u32> {
        None
    }

    /// Dropping the [`ScriptedWorker`] counts as a crash
    async fn wait(&mut self) -> Option<i32> {
        (&mut self.exit).await.ok()
    }

    async fn kill(&mut self) {
        self.exit.close();
    }
}

/// The worker side of a scripted launch
pub struct ScriptedWorker {
    pub env: WorkerEnv,
    reader: IpcReader<ReadHalf<DuplexStream>>,
    sender: IpcSender,
    exit: Option<oneshot::Sender<i32>>,
}

impl ScriptedWorker {
    pub fn send(&self, message: IpcMessage) -> Result<()> {
        self.sender
            .send(message.with_cluster(self.env.cluster_id))
            .map_err(|e| anyhow!("send failed: {e}"))
    }

    pub fn ready(&self) -> Result<()> {
        self.send(IpcMessage::ready(self.env.cluster_id))
    }

    pub async fn recv(&mut self) -> Result<IpcMessage> {
        tokio::time::timeout(TEST_TIMEOUT, self.reader.next())
            .await
            .map_err(|_| anyhow!("no IPC message within {TEST_TIMEOUT:?}"))??
            .ok_or_else(|| anyhow!("parent closed the channel"))
    }

    /// Next message with `op`
    pub async fn expect(&mut self, op: IpcOp) -> Result<IpcMessage> {
        let message = self.recv().await?;
        if message.op != op {
            bail!("expected {op}, got {}", message.op);
        }
        Ok(message)
    }

    /// Exit cleanly with `code`
    pub fn exit(mut self, code: i32) {
        if let Some(exit) = self.exit.take() {
            let _ = exit.send(code);
        }
    }
}

/// REST client answering from fixed data and counting calls
pub struct StubRestClient {
    calls: AtomicU32,
    pub recommended_shards: u32,
    pub max_concurrency: u32,
}

impl StubRestClient {
    pub fn new(recommended_shards: u32, max_concurrency: u32) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            recommended_shards,
            max_concurrency,
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RestClient for StubRestClient {
    async fn execute(&self, operation: &RestOperation) -> Result<Value, RestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match operation {
            RestOperation::GetGatewayBot => Ok(json!({
                "url": "wss://gateway.test",
                "shards": self.recommended_shards,
                "session_start_limit": {
                    "total": 1000,
                    "remaining": 999,
                    "reset_after": 0,
                    "max_concurrency": self.max_concurrency,
                },
            })),
            RestOperation::GetUser { user_id } => Ok(json!({ "id": user_id, "username": "stub" })),
            RestOperation::GetGuild { guild_id } if guild_id == "404" => Err(RestError::Status {
                status: 404,
                body: "Unknown Guild".to_string(),
            }),
            other => Ok(json!({ "method": other.method() })),
        }
    }
}
