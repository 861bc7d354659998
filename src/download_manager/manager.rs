//! Bounded-concurrency download queue.
//!
//! Downloads are persisted as `queued` records and started in ascending queue
//! position, never more than `max_concurrent_downloads` at once. Each started
//! download is tracked by a [`Job`](crate::jobs::Job) and monitored by its own
//! task until the external process exits, is cancelled, or times out.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{error, info, warn};

use crate::catalog::ShowCatalog;
use crate::config::DownloadManagerSettings;
use crate::error::{CoreError, CoreResult};
use crate::events::{self, EventHook};
use crate::jobs::{JobRegistry, JobStatus, JobType};
use crate::metrics;

use super::download_store::DownloadStore;
use super::downloader::{DownloadOutput, DownloadProcess, DownloadProcessError, DownloadSpec};
use super::models::*;

/// Progress never reaches 100 from the estimate alone.
const MAX_ESTIMATED_PROGRESS: u8 = 95;

/// Downloads currently executing in this process, keyed by download id.
///
/// Holding the guard returned by [`ActiveDownloads::lock`] is the single
/// critical section for claiming queued records.
#[derive(Default)]
struct ActiveDownloads {
    entries: Mutex<HashMap<String, String>>,
}

impl ActiveDownloads {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn job_id(&self, download_id: &str) -> Option<String> {
        self.lock().get(download_id).cloned()
    }

    fn remove(&self, download_id: &str) -> usize {
        let mut entries = self.lock();
        entries.remove(download_id);
        entries.len()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn job_ids(&self) -> Vec<String> {
        self.lock().values().cloned().collect()
    }
}

enum Outcome {
    Completed(DownloadOutput),
    Failed(String),
    Cancelled,
}

/// Cloning is cheap; all clones drive the same queue.
#[derive(Clone)]
pub struct DownloadManager {
    store: Arc<dyn DownloadStore>,
    catalog: Arc<dyn ShowCatalog>,
    jobs: Arc<JobRegistry>,
    process: Arc<dyn DownloadProcess>,
    events: Arc<dyn EventHook>,
    settings: Arc<DownloadManagerSettings>,
    active: Arc<ActiveDownloads>,
    /// Set by `shutdown`; no further records are claimed.
    closed: Arc<AtomicBool>,
}

impl DownloadManager {
    pub fn new(
        store: Arc<dyn DownloadStore>,
        catalog: Arc<dyn ShowCatalog>,
        jobs: Arc<JobRegistry>,
        process: Arc<dyn DownloadProcess>,
        events: Arc<dyn EventHook>,
        settings: DownloadManagerSettings,
    ) -> Self {
        Self {
            store,
            catalog,
            jobs,
            process,
            events,
            settings: Arc::new(settings),
            active: Arc::new(ActiveDownloads::default()),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Validate and persist a download request, then start it if there is
    /// capacity.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn queue_download(&self, request: DownloadRequest) -> CoreResult<DownloadRecord> {
        if !self.catalog.show_exists(&request.show_id)? {
            return Err(CoreError::not_found("show", &request.show_id));
        }

        let record = match self.store.enqueue(DownloadRecord::new(&request))? {
            EnqueueOutcome::Queued(record) => record,
            EnqueueOutcome::Duplicate { existing_id } => {
                return Err(CoreError::Conflict(format!(
                    "download {} already pending for show {} ({}/{})",
                    existing_id,
                    request.show_id,
                    request.format.as_str(),
                    request.quality.unwrap_or_default().as_str()
                )));
            }
        };
        info!(
            "Queued download {} for show {} at position {:?}",
            record.id, record.show_id, record.queue_position
        );

        self.drain_queue();
        Ok(record)
    }

    /// Claim queued records up to the free capacity and start each of them.
    ///
    /// Returns the ids of the downloads started by this pass.
    pub fn drain_queue(&self) -> Vec<String> {
        let mut started: Vec<(DownloadRecord, String)> = Vec::new();
        if self.closed.load(Ordering::SeqCst) {
            return Vec::new();
        }
        {
            let mut active = self.active.lock();
            let available = self
                .settings
                .max_concurrent_downloads
                .saturating_sub(active.len());
            if available == 0 {
                return Vec::new();
            }

            let queued = match self.store.list_queued(available) {
                Ok(queued) => queued,
                Err(e) => {
                    error!("Failed to read download queue: {:#}", e);
                    return Vec::new();
                }
            };

            for record in queued {
                let job = self.jobs.create_job(JobType::Download);
                match self.store.claim(&record.id, &job.id) {
                    Ok(true) => {
                        active.insert(record.id.clone(), job.id.clone());
                        started.push((record, job.id));
                    }
                    Ok(false) => {
                        let _ = self.jobs.update_job(&job.id, |j| {
                            j.status = JobStatus::Cancelled;
                            j.message = Some("Download left the queue before start".into());
                        });
                    }
                    Err(e) => {
                        error!("Failed to claim download {}: {:#}", record.id, e);
                        let _ = self.jobs.fail(&job.id, e.to_string());
                    }
                }
            }
            metrics::set_active_downloads(active.len());
        }

        started
            .into_iter()
            .map(|(record, job_id)| {
                let id = record.id.clone();
                self.spawn_download(record, job_id);
                id
            })
            .collect()
    }

    fn spawn_download(&self, record: DownloadRecord, job_id: String) {
        let manager = self.clone();
        tokio::spawn(async move {
            let download_id = record.id.clone();
            let worker = tokio::spawn(manager.clone().run_download(record, job_id.clone()));
            if let Err(e) = worker.await {
                error!("Download task {} panicked: {}", download_id, e);
                let message = format!("Task panic: {}", e);
                if let Err(e) = manager.store.mark_failed(&download_id, &message) {
                    error!("Failed to record panic for {}: {:#}", download_id, e);
                }
                let _ = manager.jobs.fail(&job_id, message);
            }
            manager.release(&download_id);
        });
    }

    fn release(&self, download_id: &str) {
        let remaining = self.active.remove(download_id);
        metrics::set_active_downloads(remaining);
        self.drain_queue();
    }

    fn output_path(&self, record: &DownloadRecord) -> PathBuf {
        self.settings.download_dir.join(&record.show_id).join(format!(
            "{}-{}.{}",
            record.show_id,
            record.quality.as_str(),
            record.format.file_extension()
        ))
    }

    /// Coarse time-based estimate. Not derived from transfer progress.
    fn estimate_progress(&self, quality: DownloadQuality, elapsed: Duration) -> u8 {
        let expected =
            self.settings.estimated_duration.as_secs_f64() * quality.size_factor() as f64;
        if expected <= 0.0 {
            return 0;
        }
        let pct = (elapsed.as_secs_f64() / expected * 100.0) as u64;
        pct.min(MAX_ESTIMATED_PROGRESS as u64) as u8
    }

    async fn run_download(self, record: DownloadRecord, job_id: String) {
        let started = Instant::now();

        // The job may have been cancelled between claim and here.
        let outcome = if self
            .jobs
            .mark_running(&job_id, format!("Downloading show {}", record.show_id))
            .is_err()
        {
            Outcome::Cancelled
        } else {
            self.monitor_process(&record, &job_id, started).await
        };
        let elapsed = started.elapsed();

        match outcome {
            Outcome::Completed(output) => {
                let file_path = output.file_path.to_string_lossy().into_owned();
                let file_size = output.file_size as i64;
                match self.store.mark_completed(&record.id, &file_path, file_size) {
                    Ok(true) => {
                        info!(
                            "Download {} completed in {:?}: {} ({} bytes)",
                            record.id, elapsed, file_path, file_size
                        );
                        let _ = self.jobs.complete(
                            &job_id,
                            "Download completed",
                            Some(json!({ "file_path": file_path, "file_size": file_size })),
                        );
                        metrics::record_download_finished("completed", elapsed);
                        self.events.emit(
                            events::DOWNLOAD_COMPLETED,
                            json!({
                                "download_id": record.id,
                                "show_id": record.show_id,
                                "format": record.format,
                                "quality": record.quality,
                                "file_path": file_path,
                                "file_size": file_size,
                            }),
                        );
                    }
                    Ok(false) => {
                        // Cancelled while the process was finishing.
                        let _ = self.jobs.mark_cancelled(&job_id);
                        metrics::record_download_finished("cancelled", elapsed);
                    }
                    Err(e) => {
                        error!("Failed to record completion of {}: {:#}", record.id, e);
                        let _ = self.jobs.fail(&job_id, e.to_string());
                    }
                }
            }
            Outcome::Failed(reason) => {
                warn!("Download {} failed after {:?}: {}", record.id, elapsed, reason);
                if let Err(e) = self.store.mark_failed(&record.id, &reason) {
                    error!("Failed to record failure of {}: {:#}", record.id, e);
                }
                let _ = self.jobs.fail(&job_id, reason.clone());
                metrics::record_download_finished("failed", elapsed);
                self.events.emit(
                    events::DOWNLOAD_FAILED,
                    json!({
                        "download_id": record.id,
                        "show_id": record.show_id,
                        "error": reason,
                    }),
                );
            }
            Outcome::Cancelled => {
                info!("Download {} cancelled after {:?}", record.id, elapsed);
                if let Err(e) = self.store.mark_cancelled(&record.id) {
                    error!("Failed to record cancellation of {}: {:#}", record.id, e);
                }
                let _ = self.jobs.mark_cancelled(&job_id);
                metrics::record_download_finished("cancelled", elapsed);
                self.events.emit(
                    events::DOWNLOAD_CANCELLED,
                    json!({ "download_id": record.id, "show_id": record.show_id }),
                );
            }
        }
    }

    /// Wait for the process, pushing estimated progress, until it exits, the
    /// job is cancelled, or the deadline passes.
    async fn monitor_process(
        &self,
        record: &DownloadRecord,
        job_id: &str,
        started: Instant,
    ) -> Outcome {
        let job_token = match self.jobs.get_job(job_id) {
            Some(job) => job.cancellation_token(),
            None => return Outcome::Failed(format!("job {} disappeared", job_id)),
        };
        // Child token so a timeout can stop the process without reading as a
        // user cancellation.
        let process_token = job_token.child_token();

        let spec = DownloadSpec {
            download_id: record.id.clone(),
            show_id: record.show_id.clone(),
            format: record.format,
            quality: record.quality,
            output_path: self.output_path(record),
        };

        let process = Arc::clone(&self.process);
        let run = process.run(&spec, process_token.clone());
        tokio::pin!(run);

        let mut progress_timer = tokio::time::interval(self.settings.progress_interval);
        progress_timer.tick().await;
        let deadline = tokio::time::sleep(self.settings.download_timeout);
        tokio::pin!(deadline);
        let mut timed_out = false;

        loop {
            tokio::select! {
                result = &mut run => {
                    return match result {
                        Ok(output) => Outcome::Completed(output),
                        Err(DownloadProcessError::Cancelled) if timed_out => Outcome::Failed(format!(
                            "timed out after {:?}",
                            self.settings.download_timeout
                        )),
                        Err(DownloadProcessError::Cancelled) => Outcome::Cancelled,
                        Err(e) => Outcome::Failed(e.to_string()),
                    };
                }
                _ = progress_timer.tick() => {
                    let progress = self.estimate_progress(record.quality, started.elapsed());
                    let _ = self.jobs.set_progress(job_id, progress);
                }
                _ = &mut deadline, if !timed_out => {
                    warn!(
                        "Download {} exceeded {:?}, stopping",
                        record.id, self.settings.download_timeout
                    );
                    timed_out = true;
                    process_token.cancel();
                }
            }
        }
    }

    /// Cancel a download that has not finished.
    ///
    /// An executing download has its job signalled, which terminates the
    /// external process; its record is marked `cancelled` immediately.
    pub fn cancel_download(&self, id: &str) -> CoreResult<()> {
        let record = self
            .store
            .get(id)?
            .ok_or_else(|| CoreError::not_found("download", id))?;
        if record.status.is_terminal() {
            return Err(CoreError::InvalidState(format!(
                "download {} is already {}",
                id, record.status
            )));
        }

        if let Some(job_id) = self.active.job_id(id) {
            self.jobs.cancel_job(&job_id)?;
            self.store.mark_cancelled(id)?;
            info!("Cancelling active download {} (job {})", id, job_id);
            return Ok(());
        }

        if self.store.mark_cancelled(id)? {
            info!("Cancelled queued download {}", id);
            self.events.emit(
                events::DOWNLOAD_CANCELLED,
                json!({ "download_id": id, "show_id": record.show_id }),
            );
            return Ok(());
        }

        // Lost a race: the record either finished or was just claimed.
        match self.active.job_id(id) {
            Some(job_id) => {
                self.jobs.cancel_job(&job_id)?;
                self.store.mark_cancelled(id)?;
                Ok(())
            }
            None => Err(CoreError::InvalidState(format!(
                "download {} is no longer cancellable",
                id
            ))),
        }
    }

    pub fn get_download(&self, id: &str) -> CoreResult<DownloadRecord> {
        self.store
            .get(id)?
            .ok_or_else(|| CoreError::not_found("download", id))
    }

    pub fn list_downloads(
        &self,
        status: Option<DownloadStatus>,
        limit: usize,
        offset: usize,
    ) -> CoreResult<Vec<DownloadRecord>> {
        Ok(self.store.list(status, limit, offset)?)
    }

    /// 1-based rank among queued downloads, `None` once dequeued.
    pub fn queue_position(&self, id: &str) -> CoreResult<Option<usize>> {
        self.get_download(id)?;
        Ok(self.store.queue_position(id)?)
    }

    pub fn get_download_stats(&self) -> CoreResult<DownloadStats> {
        let mut stats = self.store.stats()?;
        stats.active_count = self.active.len();
        stats.max_concurrent = self.settings.max_concurrent_downloads;
        Ok(stats)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Fail records left `in_progress` by a previous process, then start
    /// whatever fits.
    pub fn recover(&self) -> CoreResult<usize> {
        let interrupted = self.store.fail_interrupted()?;
        if interrupted > 0 {
            warn!("Marked {} interrupted downloads as failed", interrupted);
        }
        let started = self.drain_queue();
        info!(
            "Download queue recovered, started {} queued downloads",
            started.len()
        );
        Ok(interrupted)
    }

    /// Stop claiming queued records, signal every executing download and wait
    /// up to `grace` for them to stop.
    pub async fn shutdown(&self, grace: Duration) {
        self.closed.store(true, Ordering::SeqCst);
        let job_ids = self.active.job_ids();
        if job_ids.is_empty() {
            return;
        }
        info!("Stopping {} active downloads", job_ids.len());
        for job_id in &job_ids {
            let _ = self.jobs.cancel_job(job_id);
        }

        let deadline = tokio::time::Instant::now() + grace;
        while !self.active.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "{} downloads still active after shutdown grace period",
                    self.active.len()
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
