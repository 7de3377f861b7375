//! IPC message envelope and typed payloads
//!
//! Every line on the channel is one [`IpcMessage`] in camelCase JSON:
//! `{"op":"EVAL","data":{...},"request":true,"shard":3,"clusterId":1}`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shard_core::{Nonce, ShardState};
use std::fmt;
use thiserror::Error;

use super::{IpcError, IpcOp};

/// One message on the IPC channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpcMessage {
    pub op: IpcOp,
    #[serde(default)]
    pub data: Value,
    /// Set when the sender expects a correlated reply
    #[serde(default)]
    pub request: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<u32>,
}

impl IpcMessage {
    /// A message that expects no reply
    pub fn new(op: IpcOp, data: Value) -> Self {
        Self {
            op,
            data,
            request: false,
            shard: None,
            cluster_id: None,
        }
    }

    /// A message that expects a correlated reply
    pub fn request(op: IpcOp, data: Value) -> Self {
        Self {
            request: true,
            ..Self::new(op, data)
        }
    }

    /// Encode a typed payload as `data`
    pub fn with_payload<T: Serialize>(op: IpcOp, payload: &T) -> Result<Self, IpcError> {
        let data =
            serde_json::to_value(payload).map_err(|e| IpcError::Serialization(e.to_string()))?;
        Ok(Self::new(op, data))
    }

    #[must_use]
    pub fn as_request(mut self) -> Self {
        self.request = true;
        self
    }

    #[must_use]
    pub fn with_shard(mut self, shard_id: u32) -> Self {
        self.shard = Some(shard_id);
        self
    }

    #[must_use]
    pub fn with_cluster(mut self, cluster_id: u32) -> Self {
        self.cluster_id = Some(cluster_id);
        self
    }

    /// Decode `data` as the payload type of this op
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, IpcError> {
        T::deserialize(&self.data).map_err(|e| IpcError::UnexpectedPayload {
            op: self.op,
            reason: e.to_string(),
        })
    }

    // =========================================================================
    // Builders
    // =========================================================================

    /// Worker finished bootstrapping
    pub fn ready(cluster_id: u32) -> Self {
        Self::new(IpcOp::Ready, Value::Null).with_cluster(cluster_id)
    }

    /// Ask for (child) or grant (parent) permission to identify
    pub fn identify_request(shard_id: u32) -> Self {
        Self::new(IpcOp::IdentifyRequest, Value::Null).with_shard(shard_id)
    }

    pub fn respawn_all() -> Self {
        Self::new(IpcOp::RespawnAll, Value::Null)
    }

    pub fn to_line(&self) -> Result<String, IpcError> {
        let mut line =
            serde_json::to_string(self).map_err(|e| IpcError::Serialization(e.to_string()))?;
        line.push('\n');
        Ok(line)
    }

    pub fn from_line(line: &str) -> Result<Self, IpcError> {
        serde_json::from_str(line.trim_end()).map_err(|e| IpcError::Deserialization(e.to_string()))
    }
}

impl fmt::Display for IpcMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.op)?;
        if self.request {
            f.write_str(" request")?;
        }
        if let Some(shard) = self.shard {
            write!(f, " shard={shard}")?;
        }
        if let Some(cluster_id) = self.cluster_id {
            write!(f, " cluster={cluster_id}")?;
        }
        Ok(())
    }
}

/// Error raised in another process, reconstructed from `{message, name, stack}`
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{name}: {message}")]
pub struct RemoteError {
    pub message: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl RemoteError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            name: name.into(),
            stack: None,
        }
    }
}

/// `EVAL` data, for requests and replies alike
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalPayload {
    pub nonce: Nonce,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Only the cluster owning this shard evaluates; others reply `ignored`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ignored: bool,
    /// Broadcast reply: one entry per cluster that evaluated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<EvalResult>>,
}

impl EvalPayload {
    pub fn request(nonce: Nonce, code: impl Into<String>, shard: Option<u32>) -> Self {
        Self {
            nonce,
            code: Some(code.into()),
            shard,
            result: None,
            error: None,
            ignored: false,
            results: None,
        }
    }

    fn reply(nonce: Nonce) -> Self {
        Self {
            nonce,
            code: None,
            shard: None,
            result: None,
            error: None,
            ignored: false,
            results: None,
        }
    }

    pub fn success(nonce: Nonce, result: Value) -> Self {
        Self {
            result: Some(result),
            ..Self::reply(nonce)
        }
    }

    pub fn failure(nonce: Nonce, error: RemoteError) -> Self {
        Self {
            error: Some(error),
            ..Self::reply(nonce)
        }
    }

    pub fn ignored(nonce: Nonce) -> Self {
        Self {
            ignored: true,
            ..Self::reply(nonce)
        }
    }

    pub fn broadcast(nonce: Nonce, results: Vec<EvalResult>) -> Self {
        Self {
            results: Some(results),
            ..Self::reply(nonce)
        }
    }

    /// Interpret a single-cluster reply
    pub fn outcome(self) -> EvalOutcome {
        if self.ignored {
            EvalOutcome::Ignored
        } else if let Some(error) = self.error {
            EvalOutcome::Failed(error)
        } else {
            EvalOutcome::Value(self.result.unwrap_or(Value::Null))
        }
    }
}

/// What one cluster made of an evaluation request
#[derive(Debug, Clone, PartialEq)]
pub enum EvalOutcome {
    Value(Value),
    Failed(RemoteError),
    /// The cluster does not own the targeted shard
    Ignored,
}

impl EvalOutcome {
    /// Broadcast entry for this outcome; `None` when ignored
    pub fn into_result(self) -> Option<EvalResult> {
        match self {
            Self::Value(value) => Some(EvalResult::Ok { result: value }),
            Self::Failed(error) => Some(EvalResult::Err { error }),
            Self::Ignored => None,
        }
    }
}

/// One entry of a broadcast evaluation reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EvalResult {
    Err { error: RemoteError },
    Ok { result: Value },
}

impl From<EvalResult> for Result<Value, RemoteError> {
    fn from(result: EvalResult) -> Self {
        match result {
            EvalResult::Ok { result } => Ok(result),
            EvalResult::Err { error } => Err(error),
        }
    }
}

/// `REST_REQUEST` data, for requests and replies alike
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestPayload {
    pub nonce: Nonce,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

impl RestPayload {
    pub fn request(nonce: Nonce, method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            nonce,
            method: method.into(),
            args,
            result: None,
            error: None,
        }
    }

    pub fn reply(nonce: Nonce, outcome: Result<Value, RemoteError>) -> Self {
        let (result, error) = match outcome {
            Ok(value) => (Some(value), None),
            Err(error) => (None, Some(error)),
        };
        Self {
            nonce,
            method: String::new(),
            args: Vec::new(),
            result,
            error,
        }
    }
}

/// `SHARD_STATE` data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardStatePayload {
    pub shard_id: u32,
    pub old: ShardState,
    pub state: ShardState,
}

/// `CLOSE` data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosePayload {
    pub shard_id: u32,
    #[serde(default)]
    pub code: Option<u16>,
    #[serde(default)]
    pub reason: String,
}
