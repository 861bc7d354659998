//! Built-in executors the recurring scheduler dispatches to.

mod command;
mod maintenance;

pub use command::CommandTaskRunner;
pub use maintenance::{DatabaseFile, MaintenanceService};
