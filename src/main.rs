//! Transfer agent entry point: builds the dependency-injected component graph
//! once at startup, runs the scanner/storage/worker loops until a shutdown
//! signal arrives, then drains everything with a timeout. See `SPEC_FULL.md`
//! §9 ("Module-level state: none required... constructed as a
//! dependency-injected graph built once at startup").

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use transfer_agent::api::{self, AppState};
use transfer_agent::config::Config;
use transfer_agent::copy::CopyEngine;
use transfer_agent::daemon::shutdown::ShutdownCoordinator;
use transfer_agent::event_bus::EventBus;
use transfer_agent::handlers::EventHandlers;
use transfer_agent::queue::JobQueue;
use transfer_agent::repository::FileRepository;
use transfer_agent::retry::SpaceRetryScheduler;
use transfer_agent::scanner::{scan_once, DirectoryWalker, RepositoryScanner};
use transfer_agent::state_machine::StateMachine;
use transfer_agent::storage::StorageMonitor;
use transfer_agent::template::{RuleBasedTemplateEngine, TemplateEngine, TemplateRule};
use transfer_agent::ui::UiState;
use transfer_agent::utils;
use transfer_agent::worker::JobWorkerPool;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Source directory to watch (overrides config; required if no config file is given).
    #[arg(long, value_name = "DIR")]
    source: Option<PathBuf>,

    /// Destination directory to copy into (overrides config; required if no config file is given).
    #[arg(long, value_name = "DIR")]
    destination: Option<PathBuf>,

    /// Local port for the health/version/ws HTTP surface (overrides config).
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path).with_context(|| format!("loading config from {}", path.display()))?,
        None => {
            let source = args
                .source
                .clone()
                .context("no --config given; --source is required")?;
            let destination = args
                .destination
                .clone()
                .context("no --config given; --destination is required")?;
            Config::default_with_paths(source, destination)
        }
    };
    if let Some(source) = args.source {
        config.paths.source_directory = source;
    }
    if let Some(destination) = args.destination {
        config.paths.destination_directory = destination;
    }
    if let Some(port) = args.port {
        config.agent.port = port;
    }

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    api::health::init_start_time();

    tracing::info!(
        agent_id = %config.agent.id,
        version = env!("CARGO_PKG_VERSION"),
        source = %config.paths.source_directory.display(),
        destination = %config.paths.destination_directory.display(),
        "starting transfer-agent"
    );

    let repository = FileRepository::new();
    let event_bus = EventBus::new();
    let state_machine = StateMachine::new(repository.clone(), event_bus.clone());
    let ui_state = Arc::new(UiState::new());
    let job_queue = JobQueue::new();

    let storage_monitor = Arc::new(StorageMonitor::new(
        config.paths.source_directory.clone(),
        config.paths.destination_directory.clone(),
        config.storage.clone(),
        repository.clone(),
        state_machine.clone(),
        (*ui_state).clone(),
    ));

    let space_retry = SpaceRetryScheduler::new(
        state_machine.clone(),
        Duration::from_secs(config.space_retry.space_retry_delay_seconds),
        config.space_retry.max_space_retries,
    );

    let copy_engine = Arc::new(CopyEngine::new(state_machine.clone(), event_bus.clone()));

    let template_rules: Vec<TemplateRule> = config.template.rules.clone();
    let template_engine: Arc<dyn TemplateEngine> = Arc::new(RuleBasedTemplateEngine::new(
        template_rules,
        config.template.default_category.clone(),
    ));

    let worker_pool = Arc::new(JobWorkerPool::new(
        config.copy.max_concurrent_copies,
        job_queue.clone(),
        repository.clone(),
        state_machine.clone(),
        copy_engine,
        storage_monitor.clone(),
        space_retry,
        template_engine,
        config.paths.destination_directory.clone(),
        config.copy.clone(),
        config.growing_file.clone(),
        config.space_retry.enable_pre_copy_space_check,
        event_bus.clone(),
    ));

    let event_handlers = Arc::new(EventHandlers::new(
        repository.clone(),
        state_machine.clone(),
        event_bus.clone(),
        job_queue,
        storage_monitor.clone(),
        config.copy.clone(),
    ));
    event_handlers.register(&event_bus).await;
    transfer_agent::ui::forward_file_updates(&event_bus, ui_state.clone()).await;

    let scanner = RepositoryScanner::new(repository.clone(), state_machine.clone(), event_bus.clone());
    let walker = DirectoryWalker::default();

    let app_state = AppState {
        ui_state: ui_state.clone(),
        repository: repository.clone(),
        storage_monitor: storage_monitor.clone(),
    };
    let app = api::create_router(app_state);

    let shutdown = CancellationToken::new();
    let shutdown_coordinator = ShutdownCoordinator::new();

    let mut tasks = tokio::task::JoinSet::new();

    tasks.spawn({
        let storage_monitor = storage_monitor.clone();
        let shutdown = shutdown.clone();
        async move {
            storage_monitor.run(shutdown).await;
        }
    });

    tasks.spawn({
        let worker_pool = worker_pool.clone();
        let shutdown = shutdown.clone();
        async move {
            worker_pool.run(shutdown).await;
        }
    });

    tasks.spawn({
        let shutdown = shutdown.clone();
        let scan_interval = Duration::from_secs(config.agent.scan_interval_seconds);
        let source_directory = config.paths.source_directory.clone();
        async move {
            loop {
                let (found, removed) = scan_once(&walker, &scanner, &source_directory).await;
                tracing::debug!(found, removed, "scan pass complete");
                tokio::select! {
                    _ = tokio::time::sleep(scan_interval) => {}
                    _ = shutdown.cancelled() => return,
                }
            }
        }
    });

    tasks.spawn({
        let shutdown = shutdown.clone();
        let repository = repository.clone();
        let max_age = Duration::from_secs(config.copy.keep_completed_files_hours * 3600);
        async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(3600)) => {
                        let removed = repository.sweep_old_terminal_records(max_age).await;
                        tracing::debug!(removed, "terminal-record sweep pass complete");
                    }
                    _ = shutdown.cancelled() => return,
                }
            }
        }
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.agent.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on http://{addr} (health: /health, ws: /ws)");
    let server_shutdown = shutdown.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    shutdown_coordinator.wait_for_signal().await;
    tracing::info!("shutting down: stopping scanner, storage monitor, and workers");
    shutdown.cancel();
    shutdown_coordinator.shutdown().await;

    match tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(result) = tasks.join_next().await {
            if let Err(error) = result {
                tracing::error!(%error, "background task panicked");
            }
        }
    })
    .await
    {
        Ok(()) => tracing::info!("background tasks stopped"),
        Err(_) => tracing::warn!("background tasks did not stop within the shutdown timeout"),
    }

    match tokio::time::timeout(Duration::from_secs(5), server_handle).await {
        Ok(Ok(Ok(()))) => tracing::info!("server shutdown complete"),
        Ok(Ok(Err(error))) => tracing::error!(%error, "server error during shutdown"),
        Ok(Err(error)) => tracing::error!(%error, "server task panicked"),
        Err(_) => tracing::warn!("server shutdown timed out, forcing exit"),
    }

    Ok(())
}
