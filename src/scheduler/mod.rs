//! Recurring scheduler: cron-driven dispatch of catalog refreshes, monitor
//! checks and maintenance tasks.

pub mod cron;
mod executors;
mod models;
mod recurring;
mod schedule_store;
mod schema;

pub use cron::{next_run, CronExpression, CronParseError};
pub use executors::{
    CatalogRefresher, MaintenanceOptions, MaintenanceRunner, MaintenanceTask, MonitorChecker,
    TaskExecutors,
};
pub use models::*;
pub(crate) use recurring::panic_message;
pub use recurring::RecurringScheduler;
pub use schedule_store::{ScheduleStore, SqliteScheduleStore};
