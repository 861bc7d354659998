use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use showvault_server::catalog::SqliteShowCatalog;
use showvault_server::config::{AppConfig, CliConfig, FileConfig};
use showvault_server::download_manager::{
    CommandDownloadProcess, DownloadManager, SqliteDownloadStore,
};
use showvault_server::events::BroadcastEventHook;
use showvault_server::jobs::JobRegistry;
use showvault_server::metrics;
use showvault_server::scheduler::{RecurringScheduler, SqliteScheduleStore, TaskExecutors};
use showvault_server::tasks::{CommandTaskRunner, DatabaseFile, MaintenanceService};

/// Used when no downloader command is configured.
const DEFAULT_DOWNLOADER_COMMAND: &str = "showvault-downloader";

/// How long active downloads get to observe cancellation on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to a TOML config file. Its values override the CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory holding catalog.db, downloads.db and scheduler.db.
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// Where finished downloads are written. Defaults to <db_dir>/downloads.
    #[clap(long, value_parser = parse_path)]
    pub download_dir: Option<PathBuf>,

    /// Executable invoked once per download.
    #[clap(long)]
    pub downloader_command: Option<String>,

    /// Maximum number of downloads running at once.
    #[clap(long)]
    pub max_concurrent_downloads: Option<usize>,

    /// The port for the metrics server (Prometheus scraping). 0 disables it.
    #[clap(long, default_value_t = 9091)]
    pub metrics_port: u16,
}

impl From<&CliArgs> for CliConfig {
    fn from(args: &CliArgs) -> Self {
        CliConfig {
            db_dir: args.db_dir.clone(),
            download_dir: args.download_dir.clone(),
            downloader_command: args.downloader_command.clone(),
            max_concurrent_downloads: args.max_concurrent_downloads,
            metrics_port: args.metrics_port,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config from {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let config = AppConfig::resolve(&CliConfig::from(&cli_args), file_config)?;
    std::fs::create_dir_all(&config.db_dir)
        .with_context(|| format!("Failed to create db dir {:?}", config.db_dir))?;

    info!("Initializing metrics...");
    metrics::init_metrics();

    info!("Opening databases in {:?}...", config.db_dir);
    let catalog = Arc::new(SqliteShowCatalog::new(config.catalog_db_path())?);
    let download_store = Arc::new(SqliteDownloadStore::new(config.downloads_db_path())?);
    let schedule_store = Arc::new(SqliteScheduleStore::new(config.scheduler_db_path())?);

    let events = Arc::new(BroadcastEventHook::new(256));
    let jobs = Arc::new(JobRegistry::new());

    let downloader_command = config.downloader_command.clone().unwrap_or_else(|| {
        warn!(
            "No downloader command configured, using {}",
            DEFAULT_DOWNLOADER_COMMAND
        );
        DEFAULT_DOWNLOADER_COMMAND.to_string()
    });
    let download_manager = DownloadManager::new(
        download_store.clone(),
        catalog,
        jobs.clone(),
        Arc::new(CommandDownloadProcess::new(downloader_command)),
        events.clone(),
        config.download_manager.clone(),
    );

    let command_runner = Arc::new(CommandTaskRunner::new(
        jobs.clone(),
        events.clone(),
        config.tasks.clone(),
    ));
    let maintenance = Arc::new(MaintenanceService::new(
        jobs.clone(),
        schedule_store.clone(),
        download_store,
        vec![
            DatabaseFile::new("catalog", config.catalog_db_path()),
            DatabaseFile::new("downloads", config.downloads_db_path()),
            DatabaseFile::new("scheduler", config.scheduler_db_path()),
        ],
        config.jobs.max_job_age,
        config.tasks.clone(),
    ));
    let scheduler = RecurringScheduler::new(
        schedule_store,
        TaskExecutors {
            catalog_refresher: command_runner.clone(),
            monitor_checker: command_runner,
            maintenance,
        },
        events.clone(),
        config.scheduler.clone(),
    )?;

    let shutdown = CancellationToken::new();

    // Forward every event to the log until a real subscriber is attached.
    let mut event_rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            info!("Event {}: {}", event.name, event.data);
        }
    });

    let cleanup_jobs = jobs.clone();
    let max_job_age = chrono::Duration::from_std(config.jobs.max_job_age)
        .context("jobs.max_job_age_hours is out of range")?;
    let cleanup_interval = config.jobs.cleanup_interval;
    let cleanup_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cleanup_interval);

        // Skip the first immediate tick, wait for the first interval
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cleanup_shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    cleanup_jobs.cleanup_old_jobs(max_job_age);
                }
            }
        }
    });

    download_manager.recover()?;
    scheduler.start().await?;

    let metrics_server = if config.metrics_port != 0 {
        let port = config.metrics_port;
        let metrics_shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = metrics::run_metrics_server(port, metrics_shutdown).await {
                error!("Metrics server failed: {:#}", e);
            }
        }))
    } else {
        None
    };

    info!(
        "ShowVault server ready: {} concurrent downloads, scheduler tick {:?}",
        config.download_manager.max_concurrent_downloads, config.scheduler.tick_interval
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    shutdown.cancel();
    if let Err(e) = scheduler.stop().await {
        warn!("Scheduler stop: {}", e);
    }
    download_manager.shutdown(SHUTDOWN_GRACE).await;
    if let Some(handle) = metrics_server {
        let _ = handle.await;
    }

    info!("ShowVault server stopped");
    Ok(())
}
