//! Single butler daemon entry point (`spec.md` §6.6).
//!
//! Every butler runs this same binary; `service.is_switchboard` in its
//! config decides whether it also owns ingestion, the durable buffer, the
//! message pipeline, retention, and approvals, or is just a spawner and
//! route inbox behind `route.execute`.

mod adapters;
mod heartbeat_client;
mod http;
mod runtime;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use butler_core::prelude::*;
use clap::Parser;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Shared, request-scoped state handed to every axum handler.
pub struct DaemonState {
    pub ctx: Context,
    pub route_inbox: Arc<RouteInboxService>,
    pub ingestion: Option<Arc<Ingestion>>,
    pub registry: Registry,
}

#[derive(Parser)]
#[command(name = "butlerd")]
#[command(version, about = "Single butler daemon", long_about = None)]
struct Cli {
    /// Directory containing `config.toml`.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(2);
        }
    };

    if let Err(err) = butler_core::observability::init_tracing(&config) {
        eprintln!("failed to initialize tracing: {err}");
        std::process::exit(2);
    }

    match run(config).await {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            tracing::error!(%err, "unrecoverable error");
            std::process::exit(1);
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let is_switchboard = config.service.is_switchboard;
    let butler_name = config.service.name.clone();
    let server_config = config.clone();

    let ctx = Context::build(config).await?;
    let registry = Arc::new(ctx.registry());
    let shutdown = CancellationToken::new();
    let mut background: Vec<JoinHandle<()>> = Vec::new();

    let session_runtime: Arc<dyn SessionRuntime> = match &ctx.config.spawner.runtime_command {
        Some(command) => Arc::new(runtime::ProcessRuntime::new(command.clone(), ctx.config.spawner.runtime_model.clone())),
        None => {
            tracing::warn!("spawner.runtime_command not configured; sessions will fail with target_unavailable");
            Arc::new(runtime::UnconfiguredRuntime)
        }
    };

    let spawner = Arc::new(Spawner::new(
        butler_name.clone(),
        ctx.db_pool.clone(),
        ctx.metrics.clone(),
        session_runtime,
        ctx.config.spawner.max_concurrent_sessions,
        Duration::from_secs(ctx.config.spawner.drain_timeout_s),
    ));

    let route_inbox = Arc::new(RouteInboxService::new(
        butler_name.clone(),
        ctx.db_pool.clone(),
        registry.clone(),
        spawner.clone(),
        ctx.metrics.clone(),
        ctx.config.route.max_retries,
        ctx.config.route.recovery_grace_s,
        ctx.config.route.processing_timeout_s,
    ));

    route_inbox.recover().await?;

    {
        let route_inbox = route_inbox.clone();
        let shutdown = shutdown.clone();
        background.push(tokio::spawn(async move {
            butler_core::route_inbox::run_process_loop(route_inbox, shutdown).await;
        }));
    }

    let buffer: Option<Arc<DurableBuffer>> = if is_switchboard {
        Some(Arc::new(DurableBuffer::new(ctx.config.buffer.clone(), Some(ctx.db_pool.clone()), ctx.metrics.clone())))
    } else {
        None
    };

    let ingestion: Option<Arc<Ingestion>> = if is_switchboard {
        Some(Arc::new(Ingestion::new(ctx.db_pool.clone(), buffer.clone())))
    } else {
        None
    };

    if is_switchboard {
        let pipeline = Arc::new(Pipeline::new(
            ctx.db_pool.clone(),
            ctx.config.pipeline.clone(),
            Arc::new(adapters::NoopClassifier),
            Arc::new(adapters::NoopExtractor),
            Arc::new(adapters::HttpRouteDispatcher::new(registry.clone(), butler_name.clone())),
            Arc::new(adapters::TelegramReactionSink::new(&ctx.config.reactions)),
        ));
        buffer.as_ref().expect("buffer built for switchboard").start(pipeline);

        let retention = ctx.retention();
        let interval_s = ctx.config.retention.sweep_interval_s;
        let shutdown = shutdown.clone();
        background.push(tokio::spawn(async move {
            run_retention_loop(retention, interval_s, shutdown).await;
        }));

        let approvals = Approvals::new(ctx.db_pool.clone());
        let shutdown = shutdown.clone();
        background.push(tokio::spawn(async move {
            run_approvals_expiry_loop(approvals, shutdown).await;
        }));

        let sweep_registry = ctx.registry();
        let stale_after_s = ctx.config.registry.stale_after_s;
        let quarantine_after_s = ctx.config.registry.quarantine_after_s;
        let sweep_interval_s = ctx.config.registry.sweep_interval_s;
        let shutdown = shutdown.clone();
        background.push(tokio::spawn(async move {
            run_registry_sweep_loop(sweep_registry, stale_after_s, quarantine_after_s, sweep_interval_s, shutdown).await;
        }));
    } else {
        let interval = Duration::from_secs(ctx.config.registry.heartbeat_interval_s);
        let switchboard_url = ctx.config.registry.switchboard_url.clone();
        let shutdown = shutdown.clone();
        background.push(tokio::spawn(async move {
            heartbeat_client::run(butler_name.clone(), switchboard_url, interval, shutdown).await;
        }));
    }

    let state_registry = ctx.registry();
    let state = Arc::new(DaemonState {
        ctx,
        route_inbox,
        ingestion,
        registry: state_registry,
    });

    let router = http::router(state);
    let server_result = Server::new(server_config).serve(router).await;

    shutdown.cancel();
    spawner.stop_accepting();
    spawner.drain().await;
    if let Some(buffer) = &buffer {
        buffer.stop().await;
    }
    for handle in background {
        handle.abort();
    }

    server_result
}

async fn run_retention_loop(retention: Retention, interval_s: u64, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_secs(interval_s)) => {}
        }
        match retention.run_sweep().await {
            Ok(report) => tracing::info!(
                pending_actions = report.pending_actions_deleted,
                approval_rules = report.approval_rules_deleted,
                approval_events = report.approval_events_deleted,
                "retention sweep complete"
            ),
            Err(err) => tracing::error!(%err, "retention sweep failed"),
        }
    }
}

async fn run_approvals_expiry_loop(approvals: Approvals, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_secs(60)) => {}
        }
        match approvals.sweep_expired().await {
            Ok(expired) if !expired.is_empty() => tracing::info!(count = expired.len(), "pending actions expired"),
            Ok(_) => {}
            Err(err) => tracing::error!(%err, "approvals expiry sweep failed"),
        }
    }
}

async fn run_registry_sweep_loop(registry: Registry, stale_after_s: i64, quarantine_after_s: i64, interval_s: u64, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_secs(interval_s)) => {}
        }
        match registry.sweep(stale_after_s, quarantine_after_s).await {
            Ok(report) if !report.staled.is_empty() || !report.quarantined.is_empty() => {
                tracing::info!(staled = report.staled.len(), quarantined = report.quarantined.len(), "registry sweep complete");
            }
            Ok(_) => {}
            Err(err) => tracing::error!(%err, "registry sweep failed"),
        }
    }
}
