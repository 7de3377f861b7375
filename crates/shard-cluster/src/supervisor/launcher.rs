//! Worker launching
//!
//! A [`WorkerLauncher`] starts the process for one cluster and hands back its IPC pipes
//! plus a [`WorkerControl`] to wait on or kill it. [`CommandLauncher`] runs a real OS
//! process; tests substitute an in-process launcher.

use async_trait::async_trait;
use shard_common::{ClusterConfig, WorkerEnv};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

use crate::error::ClusterError;

/// Lifecycle control of a launched worker
#[async_trait]
pub trait WorkerControl: Send {
    fn pid(&self) -> Option<u32>;

    /// Wait for exit; the exit code when there is one
    async fn wait(&mut self) -> Option<i32>;

    /// Terminate and reap
    async fn kill(&mut self);
}

/// A launched worker
pub struct WorkerProcess {
    /// Parent -> child pipe (the child's stdin)
    pub input: Box<dyn AsyncWrite + Send + Unpin>,
    /// Child -> parent pipe (the child's stdout)
    pub output: Box<dyn AsyncRead + Send + Unpin>,
    pub control: Box<dyn WorkerControl>,
}

/// Starts worker processes
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, env: &WorkerEnv) -> Result<WorkerProcess, ClusterError>;
}

/// Launches workers as child OS processes
///
/// The child inherits the parent's environment (gateway token and settings) plus its
/// [`WorkerEnv`] assignment. stdin/stdout carry IPC; stderr is inherited for logs.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Re-run the current executable, or `worker_path` when configured
    pub fn from_config(config: &ClusterConfig) -> Result<Self, ClusterError> {
        let program = match &config.worker_path {
            Some(path) => PathBuf::from(path),
            None => std::env::current_exe().map_err(|e| ClusterError::Spawn {
                cluster_id: 0,
                reason: format!("Failed to get current exe: {e}"),
            })?,
        };
        Ok(Self::new(program))
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

#[async_trait]
impl WorkerLauncher for CommandLauncher {
    async fn launch(&self, env: &WorkerEnv) -> Result<WorkerProcess, ClusterError> {
        let spawn_error = |reason: String| ClusterError::Spawn {
            cluster_id: env.cluster_id,
            reason,
        };

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(env.to_vars())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| spawn_error(format!("Failed to spawn worker: {e}")))?;

        let input = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error("Failed to get stdin".to_string()))?;
        let output = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error("Failed to get stdout".to_string()))?;

        tracing::debug!(
            cluster_id = env.cluster_id,
            pid = ?child.id(),
            program = %self.program.display(),
            "Worker process started"
        );

        Ok(WorkerProcess {
            input: Box::new(input),
            output: Box::new(output),
            control: Box::new(ChildControl { child }),
        })
    }
}

struct ChildControl {
    child: Child,
}

#[async_trait]
impl WorkerControl for ChildControl {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Option<i32> {
        match self.child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to wait on worker process");
                None
            }
        }
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!(error = %e, "Failed to kill worker process");
        }
    }
}
