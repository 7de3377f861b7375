//! # shard-cluster
//!
//! Multi-process clustering for the sharded gateway client.
//!
//! The parent process runs a [`ClusterOrchestrator`] that owns one [`ProcessSupervisor`]
//! per cluster. Each worker process runs [`run_worker`], which starts its share of
//! shards behind a [`ProcessAgent`]. The two sides talk newline-delimited JSON over the
//! worker's stdin/stdout.

pub mod agent;
pub mod error;
pub mod eval;
pub mod events;
pub mod ipc;
pub mod orchestrator;
pub mod rest;
pub mod supervisor;
pub mod worker;

pub use agent::ProcessAgent;
pub use error::{ClusterError, ClusterResult};
pub use eval::{BuiltinEvaluator, EvalContext, EvalError, Evaluator};
pub use events::ClusterEvent;
pub use ipc::{IpcMessage, IpcOp, RemoteError};
pub use orchestrator::{resolve_layout, ClusterOrchestrator, OrchestratorConfig};
pub use rest::{HttpRestClient, RestClient, RestError, RestOperation, RestProxy};
pub use supervisor::{
    CommandLauncher, ProcessStatus, ProcessSupervisor, SupervisorConfig, WorkerLauncher,
    WorkerProcess,
};
pub use worker::{run_worker, Worker};
