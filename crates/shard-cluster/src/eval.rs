//! Remote evaluation
//!
//! Workers answer `EVAL` requests through an [`Evaluator`]. The built-in evaluator knows a
//! fixed set of `this.*` expressions describing the worker, plus any named handlers the
//! application registers.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use shard_common::WorkerEnv;
use shard_core::ShardState;
use std::collections::HashMap;
use thiserror::Error;

use crate::ipc::RemoteError;

/// Evaluation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("Unsupported expression: {0}")]
    Unsupported(String),

    #[error("{name}: {message}")]
    Failed { name: String, message: String },
}

impl EvalError {
    pub fn failed(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn to_remote(&self) -> RemoteError {
        match self {
            Self::Unsupported(_) => RemoteError::new("EvalError", self.to_string()),
            Self::Failed { name, message } => RemoteError::new(name.clone(), message.clone()),
        }
    }
}

/// What an evaluation can see of its worker
#[derive(Debug, Clone, PartialEq)]
pub struct EvalContext {
    pub worker: WorkerEnv,
    /// Local shards and their states, ascending by id
    pub shards: Vec<(u32, ShardState)>,
}

/// Evaluates `EVAL` code inside a worker
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, code: &str, context: &EvalContext) -> Result<Value, EvalError>;
}

type Handler = Box<dyn Fn(&EvalContext) -> Result<Value, EvalError> + Send + Sync>;

/// Built-in `this.*` expressions plus registered named handlers
#[derive(Default)]
pub struct BuiltinEvaluator {
    handlers: HashMap<String, Handler>,
}

impl BuiltinEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named handler; it shadows a built-in expression of the same name
    #[must_use]
    pub fn with_handler(
        mut self,
        name: impl Into<String>,
        handler: impl Fn(&EvalContext) -> Result<Value, EvalError> + Send + Sync + 'static,
    ) -> Self {
        self.handlers.insert(name.into(), Box::new(handler));
        self
    }

    fn builtin(code: &str, context: &EvalContext) -> Option<Value> {
        let worker = &context.worker;
        let value = match code {
            "this.clusterId" => json!(worker.cluster_id),
            "this.clusterCount" => json!(worker.cluster_count),
            "this.shardCount" => json!(worker.shard_count),
            "this.firstShardId" => json!(worker.first_shard_id),
            "this.lastShardId" => json!(worker.last_shard_id),
            "this.shards" => json!(context.shards.iter().map(|(id, _)| *id).collect::<Vec<_>>()),
            "this.shardStates" => Value::Object(
                context
                    .shards
                    .iter()
                    .map(|(id, state)| (id.to_string(), json!(state)))
                    .collect::<Map<String, Value>>(),
            ),
            "this.connectedShards" => json!(context
                .shards
                .iter()
                .filter(|(_, state)| state.is_connected())
                .count()),
            _ => return None,
        };
        Some(value)
    }
}

#[async_trait]
impl Evaluator for BuiltinEvaluator {
    async fn evaluate(&self, code: &str, context: &EvalContext) -> Result<Value, EvalError> {
        let code = code.trim();
        if let Some(handler) = self.handlers.get(code) {
            return handler(context);
        }
        Self::builtin(code, context).ok_or_else(|| EvalError::Unsupported(code.to_string()))
    }
}
