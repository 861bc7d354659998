//! In-memory registry of asynchronous work.
//!
//! Every long-running operation (a download, a catalog refresh, a maintenance
//! pass) is tracked as a [`Job`]. Jobs are volatile: they live only as long as
//! the process and are evicted by [`JobRegistry::cleanup_old_jobs`].

mod models;
mod registry;

pub use models::{Job, JobStatus, JobType};
pub use registry::JobRegistry;
