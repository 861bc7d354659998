mod file_config;

pub use file_config::{
    DownloadManagerConfig, FileConfig, JobsConfig, SchedulerConfig, TasksConfig,
};

use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub download_dir: Option<PathBuf>,
    pub downloader_command: Option<String>,
    pub max_concurrent_downloads: Option<usize>,
    pub metrics_port: u16,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_dir: PathBuf,
    pub downloader_command: Option<String>,
    /// 0 disables the metrics listener.
    pub metrics_port: u16,

    pub download_manager: DownloadManagerSettings,
    pub scheduler: SchedulerSettings,
    pub jobs: JobSettings,
    pub tasks: TaskSettings,
}

#[derive(Debug, Clone)]
pub struct DownloadManagerSettings {
    pub download_dir: PathBuf,
    pub max_concurrent_downloads: usize,
    pub download_timeout: Duration,
    pub progress_interval: Duration,
    pub estimated_duration: Duration,
}

impl Default for DownloadManagerSettings {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            download_timeout: Duration::from_secs(6 * 60 * 60),
            progress_interval: Duration::from_secs(5),
            estimated_duration: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub tick_interval: Duration,
    /// Bound on schedule dispatches running at once, independent of the
    /// download concurrency.
    pub max_concurrent_dispatches: usize,
    /// Pause before the evaluation loop resumes after a panic.
    pub restart_delay: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            max_concurrent_dispatches: 4,
            restart_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobSettings {
    pub max_job_age: Duration,
    pub cleanup_interval: Duration,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            max_job_age: Duration::from_secs(24 * 60 * 60),
            cleanup_interval: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskSettings {
    pub catalog_refresh_command: Option<String>,
    pub monitor_check_command: Option<String>,
    pub backup_dir: PathBuf,
    pub execution_retention_days: u64,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            catalog_refresh_command: None,
            monitor_check_command: None,
            backup_dir: PathBuf::from("backups"),
            execution_retention_days: 30,
        }
    }
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;
        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let download_dir = file
            .download_dir
            .map(PathBuf::from)
            .or_else(|| cli.download_dir.clone())
            .unwrap_or_else(|| db_dir.join("downloads"));
        let downloader_command = file
            .downloader_command
            .or_else(|| cli.downloader_command.clone());
        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);

        let dm_defaults = DownloadManagerSettings::default();
        let dm_file = file.download_manager.unwrap_or_default();
        let max_concurrent_downloads = dm_file
            .max_concurrent_downloads
            .or(cli.max_concurrent_downloads)
            .unwrap_or(dm_defaults.max_concurrent_downloads);
        if max_concurrent_downloads == 0 {
            bail!("max_concurrent_downloads must be at least 1");
        }
        let download_manager = DownloadManagerSettings {
            download_dir,
            max_concurrent_downloads,
            download_timeout: dm_file
                .download_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(dm_defaults.download_timeout),
            progress_interval: dm_file
                .progress_interval_secs
                .map(|s| Duration::from_secs(s.max(1)))
                .unwrap_or(dm_defaults.progress_interval),
            estimated_duration: dm_file
                .estimated_duration_secs
                .map(Duration::from_secs)
                .unwrap_or(dm_defaults.estimated_duration),
        };

        let scheduler_defaults = SchedulerSettings::default();
        let scheduler_file = file.scheduler.unwrap_or_default();
        let scheduler = SchedulerSettings {
            tick_interval: scheduler_file
                .tick_interval_secs
                .map(|s| Duration::from_secs(s.max(1)))
                .unwrap_or(scheduler_defaults.tick_interval),
            max_concurrent_dispatches: scheduler_file
                .max_concurrent_dispatches
                .unwrap_or(scheduler_defaults.max_concurrent_dispatches)
                .max(1),
            restart_delay: scheduler_file
                .restart_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(scheduler_defaults.restart_delay),
        };

        let job_defaults = JobSettings::default();
        let jobs_file = file.jobs.unwrap_or_default();
        let jobs = JobSettings {
            max_job_age: jobs_file
                .max_job_age_hours
                .map(|h| Duration::from_secs(h * 60 * 60))
                .unwrap_or(job_defaults.max_job_age),
            cleanup_interval: jobs_file
                .cleanup_interval_minutes
                .map(|m| Duration::from_secs(m.max(1) * 60))
                .unwrap_or(job_defaults.cleanup_interval),
        };

        let tasks_file = file.tasks.unwrap_or_default();
        let tasks = TaskSettings {
            catalog_refresh_command: tasks_file.catalog_refresh_command,
            monitor_check_command: tasks_file.monitor_check_command,
            backup_dir: tasks_file
                .backup_dir
                .map(PathBuf::from)
                .unwrap_or_else(|| db_dir.join("backups")),
            execution_retention_days: tasks_file
                .execution_retention_days
                .unwrap_or(TaskSettings::default().execution_retention_days),
        };

        Ok(AppConfig {
            db_dir,
            downloader_command,
            metrics_port,
            download_manager,
            scheduler,
            jobs,
            tasks,
        })
    }

    pub fn catalog_db_path(&self) -> PathBuf {
        self.db_dir.join("catalog.db")
    }

    pub fn downloads_db_path(&self) -> PathBuf {
        self.db_dir.join("downloads.db")
    }

    pub fn scheduler_db_path(&self) -> PathBuf {
        self.db_dir.join("scheduler.db")
    }
}
