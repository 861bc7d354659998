//! Download queue manager.
//!
//! Persists download requests, runs at most a configured number of them at a
//! time through an external downloader, and reconciles each outcome back into
//! `downloads.db`.

mod download_store;
mod downloader;
mod manager;
mod models;
mod schema;

pub use download_store::{DownloadStore, SqliteDownloadStore};
pub use downloader::{
    CommandDownloadProcess, DownloadOutput, DownloadProcess, DownloadProcessError, DownloadSpec,
};
pub use manager::DownloadManager;
pub use models::*;
