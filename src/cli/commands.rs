//! CLI command definitions for fleet-collect.
//!
//! `serve` runs the whole collector in one process: the HTTP API, one worker
//! pool per queue, the delayed-message reaper, the health monitor and the
//! retention sweeper. The other commands are one-shot operator tools.

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::api::{build_router, AppState};
use crate::auth::CredentialValidator;
use crate::config::{CollectConfig, DifferConfig};
use crate::differ::{DiffEngine, DifferRules};
use crate::handlers::{InventoryHandler, LogSink, NotificationHandler, ProcessingHandler};
use crate::metrics::init_metrics;
use crate::scheduler::{
    DelayedReaper, HealthMonitor, QueueKind, QueueManager, RetentionSweeper, WorkerPool,
};
use crate::storage::{
    CredentialStore, Database, InventoryRepository, MemoryRepository, MigrationRunner,
};
use crate::store::{MemoryStore, QueueStore, RedisStore};

/// Inventory collector for a fleet of managed systems.
#[derive(Parser, Debug)]
#[command(name = "fleet-collect")]
#[command(about = "Collect, diff and report inventories of managed systems")]
#[command(version)]
#[command(
    long_about = "fleet-collect accepts inventory snapshots over HTTP, queues them in Redis, stores them in PostgreSQL and reports what changed between snapshots.\n\nConfiguration is read from COLLECT_* environment variables plus DATABASE_URL and REDIS_URL.\n\nExample usage:\n  fleet-collect serve\n  fleet-collect stats\n  fleet-collect dead-letters --queue processing --limit 5"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Run on in-process queues and storage instead of Redis and PostgreSQL.
    #[arg(long, global = true)]
    pub memory_store: bool,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Run the API, the workers and the background tasks until Ctrl-C.
    Serve,

    /// Apply pending database migrations.
    Migrate,

    /// Print queue statistics as JSON.
    Stats,

    /// Print dead-lettered messages of one queue as JSON.
    #[command(name = "dead-letters")]
    DeadLetters(DeadLetterArgs),
}

/// Arguments for `fleet-collect dead-letters`.
#[derive(Parser, Debug)]
pub struct DeadLetterArgs {
    /// Queue to inspect (inventory, processing, notification).
    #[arg(short, long)]
    pub queue: QueueKind,

    /// Maximum number of messages to print, newest first.
    #[arg(short = 'n', long, default_value = "20")]
    pub limit: usize,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parses CLI args and runs the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = CollectConfig::from_env().context("invalid configuration")?;

    match cli.command {
        Commands::Serve => run_serve(config, cli.memory_store).await,
        Commands::Migrate => run_migrate(&config, cli.memory_store).await,
        Commands::Stats => run_stats(&config, cli.memory_store).await,
        Commands::DeadLetters(args) => run_dead_letters(&config, cli.memory_store, args).await,
    }
}

/// Store and repositories a command runs against.
struct Backends {
    store: Arc<dyn QueueStore>,
    credentials: Arc<dyn CredentialStore>,
    repository: Arc<dyn InventoryRepository>,
}

async fn connect_store(config: &CollectConfig, in_memory: bool) -> anyhow::Result<Arc<dyn QueueStore>> {
    if in_memory {
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = RedisStore::connect(&config.redis.url, config.redis.db)
        .await
        .with_context(|| format!("failed to connect to Redis at {}", config.redis.url))?;
    Ok(Arc::new(store))
}

async fn connect_database(config: &CollectConfig) -> anyhow::Result<Database> {
    let url = config.require_database_url()?;
    let db = Database::connect(url)
        .await
        .context("failed to connect to PostgreSQL")?;
    Ok(db)
}

async fn connect_backends(config: &CollectConfig, in_memory: bool) -> anyhow::Result<Backends> {
    let store = connect_store(config, in_memory).await?;

    if in_memory {
        warn!("Running on in-memory storage; no system can authenticate and nothing is persisted");
        let repo = Arc::new(MemoryRepository::new());
        return Ok(Backends {
            store,
            credentials: repo.clone(),
            repository: repo,
        });
    }

    let db = connect_database(config).await?;
    let applied = db.run_migrations().await?;
    if applied > 0 {
        info!(applied = applied, "Database migrations applied");
    }
    let db = Arc::new(db);
    Ok(Backends {
        store,
        credentials: db.clone(),
        repository: db,
    })
}

/// Loads the diff rules and applies the configured depth override.
fn build_engine(config: &DifferConfig) -> anyhow::Result<DiffEngine> {
    let mut rules = DifferRules::load(config.rules_path.as_deref())?;
    if let Some(depth) = config.max_diff_depth {
        rules.limits.max_diff_depth = depth;
    }
    Ok(DiffEngine::new(&rules)?)
}

async fn run_serve(config: CollectConfig, in_memory: bool) -> anyhow::Result<()> {
    init_metrics().context("failed to register metrics")?;

    let backends = connect_backends(&config, in_memory).await?;
    let engine = Arc::new(build_engine(&config.differ)?);
    let queue = Arc::new(QueueManager::new(
        backends.store.clone(),
        config.queue.clone(),
    ));
    let validator = Arc::new(CredentialValidator::new(
        backends.store.clone(),
        backends.credentials.clone(),
        config.auth.clone(),
    ));

    let repo = backends.repository.clone();
    let workers = &config.workers;
    let mut pools = vec![
        WorkerPool::new(
            workers.pool(workers.inventory_workers),
            queue.clone(),
            Arc::new(InventoryHandler::new(repo.clone(), queue.clone())),
        ),
        WorkerPool::new(
            workers.pool(workers.processing_workers),
            queue.clone(),
            Arc::new(ProcessingHandler::new(repo.clone(), queue.clone(), engine)),
        ),
        WorkerPool::new(
            workers.pool(workers.notification_workers),
            queue.clone(),
            Arc::new(NotificationHandler::new(repo.clone(), Arc::new(LogSink))),
        ),
    ];
    for pool in &mut pools {
        pool.start()?;
    }

    let (shutdown_tx, _) = broadcast::channel(1);
    let schedule = &config.schedule;
    let background: Vec<JoinHandle<()>> = vec![
        tokio::spawn(
            DelayedReaper::new(queue.clone(), schedule.reaper_interval).run(shutdown_tx.subscribe()),
        ),
        tokio::spawn(
            HealthMonitor::new(queue.clone(), schedule.health_check_interval)
                .with_heartbeats(repo.clone(), schedule.heartbeat_timeout)
                .run(shutdown_tx.subscribe()),
        ),
        tokio::spawn(
            RetentionSweeper::new(
                repo.clone(),
                config.retention.policy(),
                config.retention.cleanup_interval,
            )
            .run(shutdown_tx.subscribe()),
        ),
    ];

    let router = build_router(AppState {
        validator,
        queue: queue.clone(),
        repository: repo,
        config: config.api.clone(),
    });
    let listener = tokio::net::TcpListener::bind(config.api.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.api.listen_addr))?;
    info!(addr = %config.api.listen_addr, "Collector listening");

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!("Stopping background tasks and workers");
    let _ = shutdown_tx.send(());
    for handle in background {
        if let Err(e) = handle.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }
    for pool in &mut pools {
        let kind = pool.kind();
        if let Err(e) = pool.shutdown().await {
            warn!(queue = %kind, error = %e, "Worker pool did not stop cleanly");
        }
    }

    served.context("HTTP server failed")?;
    info!("Collector stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
        return;
    }
    info!("Shutdown signal received");
}

async fn run_migrate(config: &CollectConfig, in_memory: bool) -> anyhow::Result<()> {
    if in_memory {
        bail!("migrate needs PostgreSQL; drop --memory-store");
    }
    let db = connect_database(config).await?;
    let applied = db.run_migrations().await?;
    println!("Applied {} migration(s)", applied);

    for migration in MigrationRunner::new(db.pool().clone())
        .applied_migrations()
        .await?
    {
        println!(
            "  {}  {}  {}",
            migration.name,
            migration.applied_at.to_rfc3339(),
            migration.checksum.get(..12).unwrap_or(&migration.checksum)
        );
    }
    Ok(())
}

async fn run_stats(config: &CollectConfig, in_memory: bool) -> anyhow::Result<()> {
    let store = connect_store(config, in_memory).await?;
    let queue = QueueManager::new(store, config.queue.clone());
    let stats = queue.get_queue_stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn run_dead_letters(
    config: &CollectConfig,
    in_memory: bool,
    args: DeadLetterArgs,
) -> anyhow::Result<()> {
    let store = connect_store(config, in_memory).await?;
    let queue = QueueManager::new(store, config.queue.clone());
    let messages = queue.peek_dead_letter(args.queue, args.limit).await?;
    println!("{}", serde_json::to_string_pretty(&messages)?);
    Ok(())
}
