use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub download_dir: Option<String>,
    pub downloader_command: Option<String>,
    pub metrics_port: Option<u16>,

    // Feature configs
    pub download_manager: Option<DownloadManagerConfig>,
    pub scheduler: Option<SchedulerConfig>,
    pub jobs: Option<JobsConfig>,
    pub tasks: Option<TasksConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct DownloadManagerConfig {
    pub max_concurrent_downloads: Option<usize>,
    pub download_timeout_secs: Option<u64>,
    pub progress_interval_secs: Option<u64>,
    /// Expected duration of a standard-quality download, for progress estimates.
    pub estimated_duration_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_secs: Option<u64>,
    pub max_concurrent_dispatches: Option<usize>,
    pub restart_delay_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct JobsConfig {
    pub max_job_age_hours: Option<u64>,
    pub cleanup_interval_minutes: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct TasksConfig {
    pub catalog_refresh_command: Option<String>,
    pub monitor_check_command: Option<String>,
    pub backup_dir: Option<String>,
    pub execution_retention_days: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
