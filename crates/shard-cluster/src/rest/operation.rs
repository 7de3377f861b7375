//! Closed set of proxied REST operations

use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;

use super::RestError;

/// A REST call a worker may ask the parent to perform
#[derive(Debug, Clone, PartialEq)]
pub enum RestOperation {
    GetGateway,
    GetGatewayBot,
    GetUser { user_id: String },
    GetChannel { channel_id: String },
    GetGuild { guild_id: String },
    CreateMessage { channel_id: String, body: Value },
}

impl RestOperation {
    /// Parse a `(method, args)` pair from the wire
    pub fn parse(method: &str, args: &[Value]) -> Result<Self, RestError> {
        let operation = match method {
            "getGateway" => Self::GetGateway,
            "getGatewayBot" => Self::GetGatewayBot,
            "getUser" => Self::GetUser {
                user_id: id_arg(method, args, 0)?,
            },
            "getChannel" => Self::GetChannel {
                channel_id: id_arg(method, args, 0)?,
            },
            "getGuild" => Self::GetGuild {
                guild_id: id_arg(method, args, 0)?,
            },
            "createMessage" => Self::CreateMessage {
                channel_id: id_arg(method, args, 0)?,
                body: match args.get(1) {
                    Some(body @ Value::Object(_)) => body.clone(),
                    Some(Value::String(content)) => serde_json::json!({ "content": content }),
                    _ => return Err(invalid(method, "expected a message body at position 1")),
                },
            },
            other => return Err(RestError::UnknownOperation(other.to_string())),
        };
        Ok(operation)
    }

    /// Wire method name
    pub const fn method(&self) -> &'static str {
        match self {
            Self::GetGateway => "getGateway",
            Self::GetGatewayBot => "getGatewayBot",
            Self::GetUser { .. } => "getUser",
            Self::GetChannel { .. } => "getChannel",
            Self::GetGuild { .. } => "getGuild",
            Self::CreateMessage { .. } => "createMessage",
        }
    }

    /// Wire arguments, inverse of [`RestOperation::parse`]
    pub fn args(&self) -> Vec<Value> {
        match self {
            Self::GetGateway | Self::GetGatewayBot => Vec::new(),
            Self::GetUser { user_id: id }
            | Self::GetChannel { channel_id: id }
            | Self::GetGuild { guild_id: id } => vec![Value::String(id.clone())],
            Self::CreateMessage { channel_id, body } => {
                vec![Value::String(channel_id.clone()), body.clone()]
            }
        }
    }

    /// HTTP method and path relative to the API base
    pub fn route(&self) -> (Method, String) {
        match self {
            Self::GetGateway => (Method::GET, "/gateway".to_string()),
            Self::GetGatewayBot => (Method::GET, "/gateway/bot".to_string()),
            Self::GetUser { user_id } => (Method::GET, format!("/users/{user_id}")),
            Self::GetChannel { channel_id } => (Method::GET, format!("/channels/{channel_id}")),
            Self::GetGuild { guild_id } => (Method::GET, format!("/guilds/{guild_id}")),
            Self::CreateMessage { channel_id, .. } => {
                (Method::POST, format!("/channels/{channel_id}/messages"))
            }
        }
    }

    pub fn body(&self) -> Option<&Value> {
        match self {
            Self::CreateMessage { body, .. } => Some(body),
            _ => None,
        }
    }

    /// Reads may be answered from the proxy cache; writes always reach the API
    pub const fn is_cacheable(&self) -> bool {
        !matches!(self, Self::CreateMessage { .. })
    }

    /// Cache key: method name plus arguments
    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.method(), Value::Array(self.args()))
    }
}

impl fmt::Display for RestOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (method, path) = self.route();
        write!(f, "{} ({method} {path})", self.method())
    }
}

fn invalid(method: &str, reason: &str) -> RestError {
    RestError::InvalidArguments {
        method: method.to_string(),
        reason: reason.to_string(),
    }
}

/// Snowflake ids arrive as strings or numbers
fn id_arg(method: &str, args: &[Value], index: usize) -> Result<String, RestError> {
    match args.get(index) {
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        Some(Value::Number(id)) => Ok(id.to_string()),
        _ => Err(invalid(method, &format!("expected an id at position {index}"))),
    }
}

/// `GET /gateway/bot` response
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewayBotInfo {
    pub url: String,
    /// Recommended shard count
    pub shards: u32,
    pub session_start_limit: SessionStartLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SessionStartLimit {
    pub total: u32,
    pub remaining: u32,
    pub reset_after: u64,
    pub max_concurrency: u32,
}
