//! Application configuration structs
//!
//! Loads configuration from environment variables (and a `.env` file when present).

use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub app: AppSettings,
    pub gateway: GatewayConfig,
    pub sharding: ShardingConfig,
    pub timing: TimingConfig,
    pub cluster: ClusterConfig,
}

/// General application settings
#[derive(Debug, Clone, Deserialize)]
pub struct AppSettings {
    #[serde(default = "default_app_name")]
    pub name: String,
    #[serde(default = "default_env")]
    pub env: Environment,
}

/// Environment type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "production" => Some(Self::Production),
            "staging" => Some(Self::Staging),
            "development" => Some(Self::Development),
            _ => None,
        }
    }

    /// `APP_ENV` alone, for setup that runs before the full configuration is loaded
    #[must_use]
    pub fn current() -> Self {
        let _ = dotenvy::dotenv();
        env::var("APP_ENV")
            .ok()
            .and_then(|s| Self::parse(&s))
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }

    #[must_use]
    pub fn is_development(&self) -> bool {
        matches!(self, Self::Development)
    }
}

/// Gateway connection settings shared by every shard
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Gateway WebSocket URL (query string is appended by the connection)
    #[serde(default = "default_gateway_url")]
    pub url: String,
    /// Bot token, passed through verbatim in Identify/Resume
    pub token: String,
    /// Gateway intents bitfield
    #[serde(default)]
    pub intents: u64,
    /// Member count above which guilds are sent without offline members
    #[serde(default = "default_large_threshold")]
    pub large_threshold: u32,
    /// Request zlib-compressed payloads
    #[serde(default)]
    pub compress: bool,
    /// Base URL of the REST API
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

/// Total shard count: fixed, or recommended by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ShardCount {
    #[default]
    Auto,
    Fixed(u32),
}

impl FromStr for ShardCount {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        match s.parse::<u32>() {
            Ok(0) | Err(_) => Err(ConfigError::InvalidValue("TOTAL_SHARDS", s.to_string())),
            Ok(n) => Ok(Self::Fixed(n)),
        }
    }
}

/// How shards are split into clusters
#[derive(Debug, Clone, Deserialize)]
pub struct ShardingConfig {
    #[serde(default)]
    pub total_shards: ShardCount,
    /// First shard id handled by this deployment (defaults to 0)
    #[serde(default)]
    pub first_shard: Option<u32>,
    /// Last shard id handled by this deployment (defaults to total - 1)
    #[serde(default)]
    pub last_shard: Option<u32>,
    #[serde(default = "default_cluster_count")]
    pub cluster_count: u32,
    /// Identify concurrency; `None` uses the gateway's recommendation
    #[serde(default)]
    pub max_concurrency: Option<u32>,
}

/// Timers, timeouts and pacing
#[derive(Debug, Clone, Deserialize)]
pub struct TimingConfig {
    /// Minimum spacing between handshakes in one concurrency group
    #[serde(default = "default_identify_spacing_ms")]
    pub identify_spacing_ms: u64,
    /// How long a granted handshake may take to reach CONNECTED
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// How long to wait for a worker's READY (0 = no limit)
    #[serde(default = "default_spawn_timeout_ms")]
    pub spawn_timeout_ms: u64,
    #[serde(default = "default_eval_timeout_ms")]
    pub eval_timeout_ms: u64,
    /// Idle time after which a rate-limited queue is dropped
    #[serde(default = "default_queue_expire_ms")]
    pub queue_expire_ms: u64,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    /// Lifetime of a cached proxied REST response
    #[serde(default = "default_rest_cache_ttl_ms")]
    pub rest_cache_ttl_ms: u64,
    /// Outbound frames allowed per send window
    #[serde(default = "default_send_limit")]
    pub send_limit: u32,
    #[serde(default = "default_send_window_ms")]
    pub send_window_ms: u64,
}

impl TimingConfig {
    pub fn identify_spacing(&self) -> Duration {
        Duration::from_millis(self.identify_spacing_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// `None` when READY is awaited without a limit
    pub fn spawn_timeout(&self) -> Option<Duration> {
        (self.spawn_timeout_ms > 0).then(|| Duration::from_millis(self.spawn_timeout_ms))
    }

    pub fn eval_timeout(&self) -> Duration {
        Duration::from_millis(self.eval_timeout_ms)
    }

    pub fn queue_expire(&self) -> Duration {
        Duration::from_millis(self.queue_expire_ms)
    }

    pub fn rest_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.rest_cache_ttl_ms)
    }

    pub fn send_window(&self) -> Duration {
        Duration::from_millis(self.send_window_ms)
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            identify_spacing_ms: default_identify_spacing_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            spawn_timeout_ms: default_spawn_timeout_ms(),
            eval_timeout_ms: default_eval_timeout_ms(),
            queue_expire_ms: default_queue_expire_ms(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            rest_cache_ttl_ms: default_rest_cache_ttl_ms(),
            send_limit: default_send_limit(),
            send_window_ms: default_send_window_ms(),
        }
    }
}

/// Worker process supervision
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Re-spawn a worker that exits unexpectedly
    #[serde(default = "default_respawn")]
    pub respawn: bool,
    /// Worker executable; defaults to the current executable
    #[serde(default)]
    pub worker_path: Option<String>,
}

// Default value functions
fn default_app_name() -> String {
    "shard-cluster".to_string()
}

fn default_env() -> Environment {
    Environment::Development
}

fn default_gateway_url() -> String {
    "wss://gateway.discord.gg".to_string()
}

fn default_api_base() -> String {
    "https://discord.com/api/v10".to_string()
}

fn default_large_threshold() -> u32 {
    50
}

fn default_cluster_count() -> u32 {
    1
}

fn default_identify_spacing_ms() -> u64 {
    5_000
}

fn default_handshake_timeout_ms() -> u64 {
    30_000
}

fn default_spawn_timeout_ms() -> u64 {
    60_000
}

fn default_eval_timeout_ms() -> u64 {
    10_000
}

fn default_queue_expire_ms() -> u64 {
    60_000
}

fn default_reconnect_base_ms() -> u64 {
    1_000
}

fn default_reconnect_max_ms() -> u64 {
    60_000
}

fn default_rest_cache_ttl_ms() -> u64 {
    1_000
}

fn default_send_limit() -> u32 {
    120
}

fn default_send_window_ms() -> u64 {
    60_000
}

fn default_respawn() -> bool {
    true
}

/// Parse an optional variable, failing on values that are present but malformed
pub(crate) fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|_| ConfigError::InvalidValue(name, raw.clone()))
        })
        .transpose()
}

fn parse_bool(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<bool>, ConfigError> {
    lookup(name)
        .map(|raw| match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue(name, raw.clone())),
        })
        .transpose()
}

impl AppConfig {
    /// Load configuration from environment variables
    ///
    /// # Errors
    /// Returns an error if required environment variables are missing or malformed
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let timing_defaults = TimingConfig::default();

        let config = Self {
            app: AppSettings {
                name: lookup("APP_NAME").unwrap_or_else(default_app_name),
                env: lookup("APP_ENV")
                    .and_then(|s| Environment::parse(&s))
                    .unwrap_or_default(),
            },
            gateway: GatewayConfig {
                url: lookup("GATEWAY_URL").unwrap_or_else(default_gateway_url),
                token: lookup("BOT_TOKEN").ok_or(ConfigError::MissingVar("BOT_TOKEN"))?,
                intents: parse_var(&lookup, "GATEWAY_INTENTS")?.unwrap_or(0),
                large_threshold: parse_var(&lookup, "GATEWAY_LARGE_THRESHOLD")?
                    .unwrap_or_else(default_large_threshold),
                compress: parse_bool(&lookup, "GATEWAY_COMPRESS")?.unwrap_or(false),
                api_base: lookup("API_BASE_URL").unwrap_or_else(default_api_base),
            },
            sharding: ShardingConfig {
                total_shards: parse_var(&lookup, "TOTAL_SHARDS")?.unwrap_or_default(),
                first_shard: parse_var(&lookup, "DEPLOYMENT_FIRST_SHARD")?,
                last_shard: parse_var(&lookup, "DEPLOYMENT_LAST_SHARD")?,
                cluster_count: parse_var(&lookup, "CLUSTER_COUNT")?
                    .unwrap_or_else(default_cluster_count),
                max_concurrency: parse_var(&lookup, "MAX_CONCURRENCY")?,
            },
            timing: TimingConfig {
                identify_spacing_ms: parse_var(&lookup, "IDENTIFY_SPACING_MS")?
                    .unwrap_or(timing_defaults.identify_spacing_ms),
                handshake_timeout_ms: parse_var(&lookup, "HANDSHAKE_TIMEOUT_MS")?
                    .unwrap_or(timing_defaults.handshake_timeout_ms),
                spawn_timeout_ms: parse_var(&lookup, "SPAWN_TIMEOUT_MS")?
                    .unwrap_or(timing_defaults.spawn_timeout_ms),
                eval_timeout_ms: parse_var(&lookup, "EVAL_TIMEOUT_MS")?
                    .unwrap_or(timing_defaults.eval_timeout_ms),
                queue_expire_ms: parse_var(&lookup, "QUEUE_EXPIRE_MS")?
                    .unwrap_or(timing_defaults.queue_expire_ms),
                reconnect_base_ms: parse_var(&lookup, "RECONNECT_BASE_MS")?
                    .unwrap_or(timing_defaults.reconnect_base_ms),
                reconnect_max_ms: parse_var(&lookup, "RECONNECT_MAX_MS")?
                    .unwrap_or(timing_defaults.reconnect_max_ms),
                rest_cache_ttl_ms: parse_var(&lookup, "REST_CACHE_TTL_MS")?
                    .unwrap_or(timing_defaults.rest_cache_ttl_ms),
                send_limit: parse_var(&lookup, "SEND_LIMIT")?
                    .unwrap_or(timing_defaults.send_limit),
                send_window_ms: parse_var(&lookup, "SEND_WINDOW_MS")?
                    .unwrap_or(timing_defaults.send_window_ms),
            },
            cluster: ClusterConfig {
                respawn: parse_bool(&lookup, "CLUSTER_RESPAWN")?.unwrap_or_else(default_respawn),
                worker_path: lookup("WORKER_PATH"),
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sharding.cluster_count == 0 {
            return Err(ConfigError::InvalidValue("CLUSTER_COUNT", "0".to_string()));
        }
        if self.sharding.max_concurrency == Some(0) {
            return Err(ConfigError::InvalidValue("MAX_CONCURRENCY", "0".to_string()));
        }
        if self.timing.reconnect_base_ms > self.timing.reconnect_max_ms {
            return Err(ConfigError::InvalidValue(
                "RECONNECT_BASE_MS",
                self.timing.reconnect_base_ms.to_string(),
            ));
        }
        if self.timing.send_limit == 0 {
            return Err(ConfigError::InvalidValue("SEND_LIMIT", "0".to_string()));
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}
