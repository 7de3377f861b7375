//! Worker bootstrap
//!
//! Entry point of a cluster worker process: start the cluster's shards behind a
//! [`ProcessAgent`], announce READY, then serve parent requests until the channel closes.

use shard_common::{AppConfig, WorkerEnv};
use shard_gateway::{ShardConfig, ShardManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;

use crate::agent::ProcessAgent;
use crate::error::{ClusterError, ClusterResult};
use crate::eval::Evaluator;
use crate::ipc::{IpcReader, IpcSender};

const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// One cluster's shards and its end of the IPC channel
///
/// Built before the worker starts serving, so the embedding code can keep the agent for
/// broadcast evaluations and REST calls of its own.
pub struct Worker {
    env: WorkerEnv,
    agent: Arc<ProcessAgent>,
    manager: Arc<ShardManager>,
    writer_task: JoinHandle<()>,
}

impl Worker {
    pub fn new<W>(
        config: &AppConfig,
        env: WorkerEnv,
        writer: W,
        evaluator: Arc<dyn Evaluator>,
    ) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (sender, writer_task) = IpcSender::spawn(writer);
        let agent = ProcessAgent::new(env, sender, evaluator, config.timing.eval_timeout());

        let manager = Arc::new(ShardManager::new(
            ShardConfig::from_app_config(config),
            agent.clone(),
            env.shard_count,
        ));
        agent.attach(&manager);

        Self {
            env,
            agent,
            manager,
            writer_task,
        }
    }

    pub fn agent(&self) -> &Arc<ProcessAgent> {
        &self.agent
    }

    /// Start the shards, announce READY and serve the parent until it closes the channel
    ///
    /// Every shard is killed on the way out.
    pub async fn run<R>(self, reader: R) -> ClusterResult<()>
    where
        R: AsyncRead + Unpin,
    {
        let Self {
            env,
            agent,
            manager,
            writer_task,
        } = self;

        let spec = env.spec();
        tracing::info!(
            cluster_id = env.cluster_id,
            first_shard = spec.first_shard,
            last_shard = spec.last_shard,
            shard_count = env.shard_count,
            "Worker starting"
        );

        let forwarder = agent.forward_events(manager.events().subscribe());
        let bootstrap = manager
            .spawn_range(spec.shard_ids())
            .map_err(ClusterError::from)
            .and_then(|_| agent.ready());

        if bootstrap.is_ok() {
            agent.serve(IpcReader::new(reader)).await;
        }

        manager.kill_all();
        forwarder.abort();
        drop(manager);
        drop(agent);
        // The writer drains once the last sender is gone; stragglers still holding one are
        // not waited on
        let _ = tokio::time::timeout(WRITER_DRAIN, writer_task).await;

        tracing::info!(cluster_id = env.cluster_id, "Worker stopped");
        bootstrap
    }
}

/// Run one cluster worker over the given IPC streams
///
/// Returns once the parent closes the channel.
pub async fn run_worker<R, W>(
    config: &AppConfig,
    env: WorkerEnv,
    reader: R,
    writer: W,
    evaluator: Arc<dyn Evaluator>,
) -> ClusterResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    Worker::new(config, env, writer, evaluator).run(reader).await
}
