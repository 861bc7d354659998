//! Schedules, executions and scheduler status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::jobs::JobType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    CatalogRefresh,
    MonitorCheck,
    SystemCleanup,
    DatabaseBackup,
    HealthCheck,
    Custom,
}

impl ScheduleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleType::CatalogRefresh => "catalog_refresh",
            ScheduleType::MonitorCheck => "monitor_check",
            ScheduleType::SystemCleanup => "system_cleanup",
            ScheduleType::DatabaseBackup => "database_backup",
            ScheduleType::HealthCheck => "health_check",
            ScheduleType::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "catalog_refresh" => Some(ScheduleType::CatalogRefresh),
            "monitor_check" => Some(ScheduleType::MonitorCheck),
            "system_cleanup" => Some(ScheduleType::SystemCleanup),
            "database_backup" => Some(ScheduleType::DatabaseBackup),
            "health_check" => Some(ScheduleType::HealthCheck),
            "custom" => Some(ScheduleType::Custom),
            _ => None,
        }
    }

    /// Kind of job the executor for this schedule produces.
    pub fn job_type(&self) -> JobType {
        match self {
            ScheduleType::CatalogRefresh => JobType::CatalogRefresh,
            ScheduleType::MonitorCheck => JobType::MonitorCheck,
            _ => JobType::Maintenance,
        }
    }
}

impl fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `Active` schedules are evaluated every tick; the others are skipped.
/// `Error` means a dispatch could not even start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Active,
    Paused,
    Disabled,
    Error,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Active => "active",
            ScheduleStatus::Paused => "paused",
            ScheduleStatus::Disabled => "disabled",
            ScheduleStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ScheduleStatus::Active),
            "paused" => Some(ScheduleStatus::Paused),
            "disabled" => Some(ScheduleStatus::Disabled),
            "error" => Some(ScheduleStatus::Error),
            _ => None,
        }
    }
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(ExecutionStatus::Running),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            _ => None,
        }
    }
}

/// A recurring task definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub schedule_type: ScheduleType,
    pub cron_expression: String,
    pub status: ScheduleStatus,
    /// Opaque, passed through to the executor.
    pub parameters: serde_json::Value,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub run_count: i64,
    pub fail_count: i64,
    pub last_job_id: Option<String>,
    pub last_status: Option<ExecutionStatus>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    // Runtime only, never persisted.
    #[serde(default)]
    pub is_running: bool,
}

/// Input for creating a schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSchedule {
    pub name: String,
    #[serde(rename = "type")]
    pub schedule_type: ScheduleType,
    pub cron_expression: String,
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
    /// Defaults to `active`.
    #[serde(default)]
    pub status: Option<ScheduleStatus>,
}

/// Partial update; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleUpdate {
    pub name: Option<String>,
    pub cron_expression: Option<String>,
    pub parameters: Option<serde_json::Value>,
    pub status: Option<ScheduleStatus>,
}

/// One firing of a schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: i64,
    pub schedule_id: String,
    pub job_id: Option<String>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_secs: Option<i64>,
    pub total_schedules: usize,
    pub active_schedules: usize,
    pub running_schedules: usize,
}
