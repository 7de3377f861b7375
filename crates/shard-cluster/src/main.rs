//! Sharded gateway cluster entry point
//!
//! Run with:
//! ```bash
//! cargo run -p shard-cluster
//! ```
//!
//! The same binary is both the parent coordinator and its workers: a process started
//! with the worker environment variables runs one cluster, anything else coordinates.

use shard_cluster::{
    run_worker, BuiltinEvaluator, ClusterError, ClusterOrchestrator, CommandLauncher,
    HttpRestClient,
};
use shard_common::{
    try_init_tracing_with_config, AppConfig, AppError, Environment, TracingConfig, WorkerEnv,
};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let is_worker = WorkerEnv::is_worker();

    let tracing = TracingConfig::for_environment(Environment::current());
    // Workers keep stdout for IPC
    let tracing = if is_worker { tracing.to_stderr() } else { tracing };
    if let Err(e) = try_init_tracing_with_config(tracing) {
        eprintln!("Warning: Failed to initialize tracing: {}", e);
    }

    let result = if is_worker { worker().await } else { coordinator().await };

    if let Err(e) = result {
        let e = AppError::from(e);
        error!(error = %e, code = e.error_code(), "Process failed");
        std::process::exit(e.exit_code());
    }
}

async fn coordinator() -> Result<(), ClusterError> {
    info!("Starting cluster coordinator...");

    let config = AppConfig::from_env().map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;

    info!(
        env = ?config.app.env,
        clusters = config.sharding.cluster_count,
        total_shards = ?config.sharding.total_shards,
        "Configuration loaded"
    );

    let rest = Arc::new(HttpRestClient::from_config(&config.gateway)?);
    let launcher = Arc::new(CommandLauncher::from_config(&config.cluster)?);
    let orchestrator = ClusterOrchestrator::from_app_config(&config, launcher, rest).await?;

    tokio::select! {
        started = orchestrator.start() => {
            started?;
            info!("Cluster running; press Ctrl+C to stop");
            shutdown_signal().await;
        }
        _ = shutdown_signal() => {}
    }

    orchestrator.shutdown().await;
    Ok(())
}

async fn worker() -> Result<(), ClusterError> {
    let worker = WorkerEnv::from_env()?;
    let config = AppConfig::from_env()?;

    let evaluator = Arc::new(BuiltinEvaluator::new());
    let run = run_worker(
        &config,
        worker,
        tokio::io::stdin(),
        tokio::io::stdout(),
        evaluator,
    );

    tokio::select! {
        result = run => result,
        _ = shutdown_signal() => {
            info!(cluster_id = worker.cluster_id, "Worker interrupted");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
