//! Housekeeping behind `system_cleanup`, `database_backup`, `health_check` and
//! named `custom` schedules.

use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use rusqlite::{Connection, OpenFlags};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::config::TaskSettings;
use crate::download_manager::DownloadStore;
use crate::error::{CoreError, CoreResult};
use crate::jobs::{Job, JobRegistry, JobType};
use crate::scheduler::{
    panic_message, MaintenanceOptions, MaintenanceRunner, MaintenanceTask, ScheduleStore,
};

/// A SQLite file covered by backups and health checks.
#[derive(Debug, Clone)]
pub struct DatabaseFile {
    pub label: String,
    pub path: PathBuf,
}

impl DatabaseFile {
    pub fn new(label: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            label: label.into(),
            path: path.into(),
        }
    }
}

#[derive(Clone)]
pub struct MaintenanceService {
    jobs: Arc<JobRegistry>,
    schedules: Arc<dyn ScheduleStore>,
    downloads: Arc<dyn DownloadStore>,
    databases: Arc<Vec<DatabaseFile>>,
    max_job_age: Duration,
    settings: Arc<TaskSettings>,
}

impl MaintenanceService {
    pub fn new(
        jobs: Arc<JobRegistry>,
        schedules: Arc<dyn ScheduleStore>,
        downloads: Arc<dyn DownloadStore>,
        databases: Vec<DatabaseFile>,
        max_job_age: Duration,
        settings: TaskSettings,
    ) -> Self {
        Self {
            jobs,
            schedules,
            downloads,
            databases: Arc::new(databases),
            max_job_age,
            settings: Arc::new(settings),
        }
    }

    /// Map a custom task name onto a built-in one.
    fn resolve(task: MaintenanceTask) -> CoreResult<MaintenanceTask> {
        match task {
            MaintenanceTask::Custom(name) => match name.as_str() {
                "system_cleanup" | "cleanup" => Ok(MaintenanceTask::SystemCleanup),
                "database_backup" | "backup" => Ok(MaintenanceTask::DatabaseBackup),
                "health_check" => Ok(MaintenanceTask::HealthCheck),
                _ => Err(CoreError::ExecutionFailure(format!(
                    "unknown maintenance task: {}",
                    name
                ))),
            },
            task => Ok(task),
        }
    }

    fn run_task(&self, job_id: &str, task: &MaintenanceTask, parameters: &Value) -> Result<Value> {
        match task {
            MaintenanceTask::SystemCleanup => self.system_cleanup(parameters),
            MaintenanceTask::DatabaseBackup => self.database_backup(job_id),
            MaintenanceTask::HealthCheck => self.health_check(),
            MaintenanceTask::Custom(name) => bail!("unknown maintenance task: {}", name),
        }
    }

    /// Evict old jobs and prune execution history past retention.
    fn system_cleanup(&self, parameters: &Value) -> Result<Value> {
        let retention_days = parameters
            .get("retention_days")
            .and_then(Value::as_u64)
            .unwrap_or(self.settings.execution_retention_days);
        let cutoff = i64::try_from(retention_days)
            .ok()
            .and_then(TimeDelta::try_days)
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
            .ok_or_else(|| anyhow!("retention_days {} is out of range", retention_days))?;

        let max_age = chrono::Duration::from_std(self.max_job_age)
            .context("job max age out of range")?;
        let evicted_jobs = self.jobs.cleanup_old_jobs(max_age);

        let pruned_executions = self.schedules.prune_executions(cutoff)?;

        info!(
            "Cleanup evicted {} jobs and pruned {} executions older than {} days",
            evicted_jobs, pruned_executions, retention_days
        );
        Ok(json!({
            "evicted_jobs": evicted_jobs,
            "pruned_executions": pruned_executions,
            "retention_days": retention_days,
        }))
    }

    /// `VACUUM INTO` a consistent copy of every database under a fresh
    /// timestamped directory.
    fn database_backup(&self, job_id: &str) -> Result<Value> {
        let target_dir = self
            .settings
            .backup_dir
            .join(Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string());
        std::fs::create_dir_all(&target_dir)
            .with_context(|| format!("Failed to create backup dir {:?}", target_dir))?;

        let mut files = Vec::new();
        let total = self.databases.len().max(1);
        for (index, database) in self.databases.iter().enumerate() {
            if self.jobs.is_cancellation_requested(job_id) {
                bail!("backup cancelled after {} of {} databases", index, total);
            }
            if !database.path.exists() {
                warn!("Skipping backup of missing database {:?}", database.path);
                continue;
            }

            let target = target_dir.join(format!("{}.db", database.label));
            vacuum_into(&database.path, &target)?;
            let size = std::fs::metadata(&target).map(|m| m.len()).unwrap_or(0);
            files.push(json!({
                "database": database.label,
                "path": target.to_string_lossy(),
                "size": size,
            }));

            let _ = self
                .jobs
                .set_progress(job_id, (((index + 1) * 100) / total) as u8);
        }

        info!("Backed up {} databases into {:?}", files.len(), target_dir);
        Ok(json!({
            "backup_dir": target_dir.to_string_lossy(),
            "files": files,
        }))
    }

    /// Integrity check of every database plus the live counters.
    fn health_check(&self) -> Result<Value> {
        let mut databases = Vec::new();
        let mut unhealthy = Vec::new();
        for database in self.databases.iter() {
            match check_database(&database.path) {
                Ok((integrity, version)) => {
                    if integrity != "ok" {
                        unhealthy.push(database.label.clone());
                    }
                    databases.push(json!({
                        "database": database.label,
                        "integrity": integrity,
                        "version": version,
                    }));
                }
                Err(e) => {
                    unhealthy.push(database.label.clone());
                    databases.push(json!({
                        "database": database.label,
                        "error": format!("{:#}", e),
                    }));
                }
            }
        }

        let jobs: serde_json::Map<String, Value> = self
            .jobs
            .count_by_status()
            .into_iter()
            .map(|(status, count)| (status.as_str().to_string(), json!(count)))
            .collect();
        let downloads = self.downloads.stats()?;

        if !unhealthy.is_empty() {
            bail!("unhealthy databases: {}", unhealthy.join(", "));
        }
        Ok(json!({
            "databases": databases,
            "jobs": jobs,
            "downloads": downloads,
        }))
    }
}

fn vacuum_into(source: &Path, target: &Path) -> Result<()> {
    let conn =
        Connection::open(source).with_context(|| format!("Failed to open {:?}", source))?;
    conn.execute("VACUUM INTO ?1", [target.to_string_lossy().into_owned()])
        .with_context(|| format!("Failed to back up {:?} into {:?}", source, target))?;
    Ok(())
}

fn check_database(path: &Path) -> Result<(String, i64)> {
    if !path.exists() {
        bail!("database file {:?} does not exist", path);
    }
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .with_context(|| format!("Failed to open {:?}", path))?;
    let integrity: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok((integrity, version))
}

#[async_trait]
impl MaintenanceRunner for MaintenanceService {
    async fn run_cleanup(&self, options: MaintenanceOptions) -> CoreResult<Job> {
        let task = Self::resolve(options.task)?;
        let job = self.jobs.create_job(JobType::Maintenance);

        let service = self.clone();
        let job_id = job.id.clone();
        let parameters = options.parameters;
        tokio::task::spawn_blocking(move || {
            if service
                .jobs
                .mark_running(&job_id, format!("Running {}", task.name()))
                .is_err()
            {
                return;
            }

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                service.run_task(&job_id, &task, &parameters)
            }))
            .unwrap_or_else(|panic| {
                Err(anyhow!(
                    "{} panicked: {}",
                    task.name(),
                    panic_message(panic.as_ref())
                ))
            });

            match outcome {
                Ok(result) => {
                    let _ = service
                        .jobs
                        .complete(&job_id, format!("{} finished", task.name()), Some(result));
                }
                Err(_) if service.jobs.is_cancellation_requested(&job_id) => {
                    let _ = service.jobs.mark_cancelled(&job_id);
                }
                Err(e) => {
                    error!("Maintenance task {} failed: {:#}", task.name(), e);
                    let _ = service.jobs.fail(&job_id, format!("{:#}", e));
                }
            }
        });

        Ok(job)
    }
}
