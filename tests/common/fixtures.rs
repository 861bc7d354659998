//! Stores, collaborators and component wiring over a temporary directory.

#![allow(dead_code)]

use super::constants::ALL_SHOW_IDS;
use super::fakes::{FakeDownloader, FakeExecutors};
use showvault_server::catalog::SqliteShowCatalog;
use showvault_server::config::{DownloadManagerSettings, SchedulerSettings};
use showvault_server::download_manager::{DownloadManager, SqliteDownloadStore};
use showvault_server::events::BroadcastEventHook;
use showvault_server::jobs::JobRegistry;
use showvault_server::scheduler::{RecurringScheduler, SqliteScheduleStore};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub struct TestHarness {
    pub dir: TempDir,
    pub catalog: Arc<SqliteShowCatalog>,
    pub download_store: Arc<SqliteDownloadStore>,
    pub schedule_store: Arc<SqliteScheduleStore>,
    pub jobs: Arc<JobRegistry>,
    pub events: Arc<BroadcastEventHook>,
    pub downloader: Arc<FakeDownloader>,
    pub executors: Arc<FakeExecutors>,
}

impl TestHarness {
    /// Fresh databases with every show in `ALL_SHOW_IDS` in the catalog.
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let catalog = Arc::new(SqliteShowCatalog::new(dir.path().join("catalog.db")).unwrap());
        for (i, show_id) in ALL_SHOW_IDS.iter().enumerate() {
            catalog
                .add_show(show_id, &format!("Show {}", i + 1), None)
                .unwrap();
        }
        let download_store =
            Arc::new(SqliteDownloadStore::new(dir.path().join("downloads.db")).unwrap());
        let schedule_store =
            Arc::new(SqliteScheduleStore::new(dir.path().join("scheduler.db")).unwrap());
        let jobs = Arc::new(JobRegistry::new());

        TestHarness {
            catalog,
            download_store,
            schedule_store,
            events: Arc::new(BroadcastEventHook::new(64)),
            downloader: FakeDownloader::new(),
            executors: FakeExecutors::new(jobs.clone()),
            jobs,
            dir,
        }
    }

    pub fn download_settings(&self, max_concurrent_downloads: usize) -> DownloadManagerSettings {
        DownloadManagerSettings {
            download_dir: self.dir.path().join("downloads"),
            max_concurrent_downloads,
            download_timeout: Duration::from_secs(30),
            progress_interval: Duration::from_millis(50),
            estimated_duration: Duration::from_secs(1),
        }
    }

    pub fn download_manager(&self, max_concurrent_downloads: usize) -> DownloadManager {
        self.download_manager_with(self.download_settings(max_concurrent_downloads))
    }

    pub fn download_manager_with(&self, settings: DownloadManagerSettings) -> DownloadManager {
        DownloadManager::new(
            self.download_store.clone(),
            self.catalog.clone(),
            self.jobs.clone(),
            self.downloader.clone(),
            self.events.clone(),
            settings,
        )
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            tick_interval: Duration::from_millis(50),
            max_concurrent_dispatches: 4,
            restart_delay: Duration::from_millis(50),
        }
    }

    pub fn scheduler(&self) -> RecurringScheduler {
        self.scheduler_with(self.scheduler_settings())
    }

    pub fn scheduler_with(&self, settings: SchedulerSettings) -> RecurringScheduler {
        RecurringScheduler::new(
            self.schedule_store.clone(),
            self.executors.task_executors(),
            self.events.clone(),
            settings,
        )
        .unwrap()
    }
}

/// Poll `condition` until it holds, panicking after five seconds.
pub async fn wait_until<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting until {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
