//! ShowVault server core library
//!
//! Job registry, download queue and recurring scheduler, exposed for the
//! binary and for integration tests.

pub mod catalog;
pub mod config;
pub mod download_manager;
pub mod error;
pub mod events;
pub mod jobs;
pub mod metrics;
pub mod scheduler;
pub mod sqlite_persistence;
pub mod tasks;

pub use error::{CoreError, CoreResult};
pub use events::{BroadcastEventHook, EventHook, NoopEventHook};
pub use jobs::{Job, JobRegistry, JobStatus, JobType};
