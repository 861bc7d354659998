//! In-process stand-ins for the external downloader and the task executors.

#![allow(dead_code)]

use async_trait::async_trait;
use showvault_server::download_manager::{
    DownloadOutput, DownloadProcess, DownloadProcessError, DownloadSpec,
};
use showvault_server::error::{CoreError, CoreResult};
use showvault_server::jobs::{Job, JobRegistry, JobType};
use showvault_server::scheduler::{
    CatalogRefresher, MaintenanceOptions, MaintenanceRunner, MonitorChecker, TaskExecutors,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

pub const FAKE_FILE_SIZE: u64 = 4096;

#[derive(Debug)]
pub enum FakeOutcome {
    Succeed,
    Fail(String),
}

/// A downloader whose runs block until the test finishes them.
#[derive(Default)]
pub struct FakeDownloader {
    waiting: Mutex<HashMap<String, oneshot::Sender<FakeOutcome>>>,
    started: Mutex<Vec<String>>,
    cancelled: Mutex<Vec<String>>,
}

impl FakeDownloader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Show ids in the order their downloads started.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }

    pub fn is_waiting(&self, show_id: &str) -> bool {
        self.waiting.lock().unwrap().contains_key(show_id)
    }

    /// Finish the running download for `show_id`. Returns false if none is running.
    pub fn finish(&self, show_id: &str, outcome: FakeOutcome) -> bool {
        match self.waiting.lock().unwrap().remove(show_id) {
            Some(sender) => sender.send(outcome).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl DownloadProcess for FakeDownloader {
    async fn run(
        &self,
        spec: &DownloadSpec,
        cancel: CancellationToken,
    ) -> Result<DownloadOutput, DownloadProcessError> {
        let (sender, receiver) = oneshot::channel();
        self.waiting
            .lock()
            .unwrap()
            .insert(spec.show_id.clone(), sender);
        self.started.lock().unwrap().push(spec.show_id.clone());

        tokio::select! {
            outcome = receiver => match outcome {
                Ok(FakeOutcome::Succeed) => Ok(DownloadOutput {
                    file_path: spec.output_path.clone(),
                    file_size: FAKE_FILE_SIZE,
                }),
                Ok(FakeOutcome::Fail(message)) => Err(DownloadProcessError::Failed(message)),
                Err(_) => Err(DownloadProcessError::Failed("fake dropped".to_string())),
            },
            _ = cancel.cancelled() => {
                self.waiting.lock().unwrap().remove(&spec.show_id);
                self.cancelled.lock().unwrap().push(spec.show_id.clone());
                Err(DownloadProcessError::Cancelled)
            }
        }
    }
}

/// Executors for every schedule type. Each call creates a job in the shared
/// registry unless a failure is configured; a gate can hold calls open.
pub struct FakeExecutors {
    jobs: Arc<JobRegistry>,
    calls: Mutex<Vec<String>>,
    failure: Mutex<Option<String>>,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeExecutors {
    pub fn new(jobs: Arc<JobRegistry>) -> Arc<Self> {
        Arc::new(Self {
            jobs,
            calls: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            gate: Mutex::new(None),
        })
    }

    pub fn task_executors(self: &Arc<Self>) -> TaskExecutors {
        TaskExecutors {
            catalog_refresher: self.clone(),
            monitor_checker: self.clone(),
            maintenance: self.clone(),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_with(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }

    /// Hold every later call until the returned gate is notified once per call.
    pub fn close_gate(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    async fn call(&self, label: String, job_type: JobType) -> CoreResult<Job> {
        self.calls.lock().unwrap().push(label);

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if let Some(message) = self.failure.lock().unwrap().clone() {
            return Err(CoreError::ExecutionFailure(message));
        }
        Ok(self.jobs.create_job(job_type))
    }
}

#[async_trait]
impl CatalogRefresher for FakeExecutors {
    async fn start_refresh(&self, force: bool) -> CoreResult<Job> {
        self.call(format!("catalog_refresh force={}", force), JobType::CatalogRefresh)
            .await
    }
}

#[async_trait]
impl MonitorChecker for FakeExecutors {
    async fn check_all_monitors(&self) -> CoreResult<Job> {
        self.call("monitor_check".to_string(), JobType::MonitorCheck)
            .await
    }
}

#[async_trait]
impl MaintenanceRunner for FakeExecutors {
    async fn run_cleanup(&self, options: MaintenanceOptions) -> CoreResult<Job> {
        self.call(options.task.name().to_string(), JobType::Maintenance)
            .await
    }
}
