//! REST client

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use serde_json::Value;
use shard_common::GatewayConfig;
use std::time::Duration;

use super::{GatewayBotInfo, RestError, RestOperation};

/// Performs REST operations
#[async_trait]
pub trait RestClient: Send + Sync {
    async fn execute(&self, operation: &RestOperation) -> Result<Value, RestError>;
}

/// Fetch the recommended shard count and handshake concurrency
pub async fn gateway_bot(client: &dyn RestClient) -> Result<GatewayBotInfo, RestError> {
    let value = client.execute(&RestOperation::GetGatewayBot).await?;
    serde_json::from_value(value).map_err(|e| RestError::Decode(e.to_string()))
}

/// HTTP implementation backed by reqwest
#[derive(Debug, Clone)]
pub struct HttpRestClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpRestClient {
    const USER_AGENT: &'static str = concat!("shard-cluster/", env!("CARGO_PKG_VERSION"));

    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, RestError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent(Self::USER_AGENT)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    pub fn from_config(config: &GatewayConfig) -> Result<Self, RestError> {
        Self::new(config.api_base.clone(), config.token.clone())
    }
}

#[async_trait]
impl RestClient for HttpRestClient {
    async fn execute(&self, operation: &RestOperation) -> Result<Value, RestError> {
        let (method, path) = operation.route();
        let url = format!("{}{path}", self.base_url);

        let mut request = self
            .http
            .request(method, &url)
            .header(AUTHORIZATION, format!("Bot {}", self.token));
        if let Some(body) = operation.body() {
            request = request.json(body);
        }

        tracing::debug!(operation = %operation, "REST request");
        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(operation = %operation, status = status.as_u16(), "REST request failed");
            return Err(RestError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json::<Value>().await?)
    }
}
