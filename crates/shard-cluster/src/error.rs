//! Cluster error types

use shard_common::{AppError, ConfigError};
use shard_core::CoreError;
use shard_gateway::GatewayError;
use thiserror::Error;

use crate::eval::EvalError;
use crate::ipc::{IpcError, RemoteError};
use crate::rest::RestError;

/// Cluster layer error type
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The worker exited while the operation was pending
    #[error("process closed")]
    ProcessClosed,

    /// No live worker for this cluster
    #[error("Cluster {0} is not running")]
    NotRunning(u32),

    #[error("Unknown cluster: {0}")]
    UnknownCluster(u32),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Failed to spawn cluster {cluster_id}: {reason}")]
    Spawn { cluster_id: u32, reason: String },

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error(transparent)]
    Rest(#[from] RestError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Layout(#[from] CoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ClusterError {
    /// Get error code for logs and IPC error payloads
    pub fn code(&self) -> &'static str {
        match self {
            Self::ProcessClosed => "PROCESS_CLOSED",
            Self::NotRunning(_) => "NOT_RUNNING",
            Self::UnknownCluster(_) => "UNKNOWN_CLUSTER",
            Self::Timeout(_) => "TIMEOUT",
            Self::Spawn { .. } => "SPAWN_FAILED",
            Self::Ipc(_) => "IPC_ERROR",
            Self::Remote(_) => "REMOTE_ERROR",
            Self::Eval(_) => "EVAL_ERROR",
            Self::Rest(_) => "REST_ERROR",
            Self::Gateway(_) => "GATEWAY_ERROR",
            Self::Layout(e) => e.code(),
            Self::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Wire form for replies to another process
    pub fn to_remote(&self) -> RemoteError {
        match self {
            Self::Remote(remote) => remote.clone(),
            other => RemoteError::new(other.code(), other.to_string()),
        }
    }
}

impl From<ClusterError> for AppError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::Config(e) => Self::Config(e),
            ClusterError::Layout(e) => Self::Layout(e),
            ClusterError::Gateway(e) => Self::Gateway(e.to_string()),
            ClusterError::Rest(e) => Self::ExternalService(e.to_string()),
            other => Self::Cluster(other.to_string()),
        }
    }
}

/// Cluster result type
pub type ClusterResult<T> = Result<T, ClusterError>;
