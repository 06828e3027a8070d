//! Cirrus control plane daemon
//!
//! Boots the runtime pool from the local funclet's inventory, then serves
//! two listeners: the sandbox-facing dispatch server and the caller-facing
//! HTTP API, with the reaper sweeping the pool in the background.

use anyhow::Context;
use cirrus_controller::{router, ApiState, Invoker, InvokerOptions, Reaper};
use cirrus_funclet::{FuncletClient, UdsFuncletClient};
use cirrus_meta::{CachedFunctionStore, FunctionStore, StaticBackend};
use cirrus_observability::{
    init_observability, CirrusMetrics, ObservabilityConfig, SinkRegistry,
};
use cirrus_rtctrl::{Dispatcher, LogStoreIndex, ManagerOptions, RuntimeManager};
use cirrus_spec::{CirrusConfig, FunctionConfig};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "cirrusd", about = "Cirrus FaaS control plane daemon")]
struct Args {
    /// Path to the controller configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// YAML file with the function table served by this node
    #[arg(short, long)]
    functions: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => cirrus_spec::config_from_yaml_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => CirrusConfig::default(),
    };
    config.validate().context("validating config")?;

    let _log_guard = init_observability(&ObservabilityConfig::default())
        .context("initializing observability")?;
    let metrics = Arc::new(CirrusMetrics::new().context("building metrics")?);
    let sinks = SinkRegistry::with_builtins().context("building log sinks")?;
    let sink = sinks
        .get(&config.log_sink)
        .with_context(|| format!("unknown log sink {:?}", config.log_sink))?;

    let manager = Arc::new(RuntimeManager::new(ManagerOptions {
        base_memory_mb: config.base_memory_mb,
        milli_cpus_per_mb: config.milli_cpus_per_mb,
        max_runtime_idle: config.max_runtime_idle,
        max_runner_defunct: config.max_runner_defunct,
        max_runner_reset_timeout: config.max_runner_reset_timeout,
    }));

    let funclet = Arc::new(UdsFuncletClient::new(&config.funclet_socket));
    match funclet.node_info().await {
        Ok(node) => {
            info!(
                node_id = %node.node_id,
                runtimes = node.runtime_ids.len(),
                "node inventory loaded"
            );
            manager.update_capacity(node.capacity, node.allocatable);
            manager.sync_runtimes(node.runtime_ids);
        }
        Err(e) => {
            // Start degraded; the pool stays empty until the funclet answers
            warn!(error = %e, "funclet unreachable at startup");
        }
    }

    let backend = StaticBackend::new();
    if let Some(path) = &args.functions {
        let table = std::fs::read_to_string(path)
            .with_context(|| format!("reading function table {}", path.display()))?;
        let functions: Vec<FunctionConfig> =
            serde_yaml::from_str(&table).context("parsing function table")?;
        info!(count = functions.len(), "function table loaded");
        for function in functions {
            backend.put_function(function);
        }
    }
    let store: Arc<dyn FunctionStore> = Arc::new(CachedFunctionStore::with_ttls(
        backend,
        config.function_cache_ttl,
        config.alias_cache_ttl,
    ));

    let logs = Arc::new(LogStoreIndex::new());
    let dispatcher = Dispatcher::new(manager.clone(), logs.clone());
    let invoker = Invoker::new(
        manager.clone(),
        funclet.clone(),
        logs,
        metrics.clone(),
        sink,
        InvokerOptions {
            runtime_socket_dir: config.runtime_socket_dir.clone(),
            default_invoke_timeout: config.default_invoke_timeout,
            invocation_log_dir: config.invocation_log_dir.clone(),
            ..InvokerOptions::default()
        },
    );
    let reaper = Reaper::new(
        manager.clone(),
        funclet,
        metrics.clone(),
        config.reaper_interval,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(reaper.run(shutdown_rx));

    let dispatch_listener = TcpListener::bind(&config.dispatch_listen)
        .await
        .with_context(|| format!("binding dispatch listener on {}", config.dispatch_listen))?;
    tokio::spawn(dispatcher.serve(dispatch_listener));

    let state = Arc::new(ApiState {
        invoker,
        manager,
        store,
        metrics,
        started: Instant::now(),
    });
    let api_listener = TcpListener::bind(&config.api_listen)
        .await
        .with_context(|| format!("binding api listener on {}", config.api_listen))?;
    info!(api = %config.api_listen, dispatch = %config.dispatch_listen, "cirrusd started");

    axum::serve(api_listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("serving api")?;

    let _ = shutdown_tx.send(true);
    Ok(())
}
