//! Collaborators a schedule dispatch hands its work to.
//!
//! Each executor returns as soon as it has a [`Job`] handle; the job itself may
//! keep running in the background.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::jobs::Job;

use super::models::ScheduleType;

#[async_trait]
pub trait CatalogRefresher: Send + Sync {
    async fn start_refresh(&self, force: bool) -> CoreResult<Job>;
}

#[async_trait]
pub trait MonitorChecker: Send + Sync {
    async fn check_all_monitors(&self) -> CoreResult<Job>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaintenanceTask {
    SystemCleanup,
    DatabaseBackup,
    HealthCheck,
    /// Named by `parameters.task` on a `custom` schedule.
    Custom(String),
}

impl MaintenanceTask {
    pub fn name(&self) -> &str {
        match self {
            MaintenanceTask::SystemCleanup => "system_cleanup",
            MaintenanceTask::DatabaseBackup => "database_backup",
            MaintenanceTask::HealthCheck => "health_check",
            MaintenanceTask::Custom(name) => name,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MaintenanceOptions {
    pub task: MaintenanceTask,
    pub parameters: Value,
}

#[async_trait]
pub trait MaintenanceRunner: Send + Sync {
    async fn run_cleanup(&self, options: MaintenanceOptions) -> CoreResult<Job>;
}

#[derive(Clone)]
pub struct TaskExecutors {
    pub catalog_refresher: Arc<dyn CatalogRefresher>,
    pub monitor_checker: Arc<dyn MonitorChecker>,
    pub maintenance: Arc<dyn MaintenanceRunner>,
}

impl TaskExecutors {
    /// Run the executor matching `schedule_type` with the schedule's parameters.
    pub async fn execute(&self, schedule_type: ScheduleType, parameters: &Value) -> CoreResult<Job> {
        let task = match schedule_type {
            ScheduleType::CatalogRefresh => {
                let force = parameters
                    .get("force")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                return self.catalog_refresher.start_refresh(force).await;
            }
            ScheduleType::MonitorCheck => return self.monitor_checker.check_all_monitors().await,
            ScheduleType::SystemCleanup => MaintenanceTask::SystemCleanup,
            ScheduleType::DatabaseBackup => MaintenanceTask::DatabaseBackup,
            ScheduleType::HealthCheck => MaintenanceTask::HealthCheck,
            ScheduleType::Custom => match parameters.get("task").and_then(Value::as_str) {
                Some(name) => MaintenanceTask::Custom(name.to_string()),
                None => {
                    return Err(CoreError::ExecutionFailure(
                        "custom schedule has no parameters.task".to_string(),
                    ))
                }
            },
        };

        self.maintenance
            .run_cleanup(MaintenanceOptions {
                task,
                parameters: parameters.clone(),
            })
            .await
    }
}
