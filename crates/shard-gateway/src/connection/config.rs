//! Shard connection settings

use shard_common::AppConfig;
use std::sync::Arc;
use std::time::Duration;

use super::SessionConfig;

/// Settings shared by every shard of a process
#[derive(Debug, Clone)]
pub struct ShardConfig {
    /// Gateway base URL (version and encoding are appended)
    pub url: String,
    pub session: Arc<SessionConfig>,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    /// Frames allowed per `send_window`
    pub send_limit: u32,
    pub send_window: Duration,
    /// Idle time after which a shard's outbound queue is dropped
    pub queue_expire: Duration,
}

impl ShardConfig {
    /// Defaults for everything but the endpoint and identity
    pub fn new(url: impl Into<String>, session: SessionConfig) -> Self {
        Self {
            url: url.into(),
            session: Arc::new(session),
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(60),
            send_limit: 120,
            send_window: Duration::from_secs(60),
            queue_expire: Duration::from_secs(60),
        }
    }

    pub fn from_app_config(config: &AppConfig) -> Self {
        let gateway = &config.gateway;
        let timing = &config.timing;

        let mut session = SessionConfig::new(gateway.token.clone(), gateway.intents);
        session.large_threshold = gateway.large_threshold;
        session.compress = gateway.compress;

        Self {
            url: gateway.url.clone(),
            session: Arc::new(session),
            reconnect_base: Duration::from_millis(timing.reconnect_base_ms),
            reconnect_max: Duration::from_millis(timing.reconnect_max_ms),
            send_limit: timing.send_limit,
            send_window: timing.send_window(),
            queue_expire: timing.queue_expire(),
        }
    }
}
