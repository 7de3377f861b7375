//! Configuration structs

mod app_config;
mod worker_env;

pub use app_config::{
    AppConfig, AppSettings, ClusterConfig, ConfigError, Environment, GatewayConfig, ShardCount,
    ShardingConfig, TimingConfig,
};
pub use worker_env::WorkerEnv;
