use super::models::{Job, JobStatus, JobType};
use crate::error::{CoreError, CoreResult};
use crate::metrics;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// Owner of every [`Job`] in the process.
///
/// All mutation goes through [`JobRegistry::update_job`], which holds the write
/// lock for the whole mutation and refuses to touch a job once it has reached a
/// terminal status. Cancellation is a signal on the job's token: a worker that
/// observes it records `Cancelled` itself.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, Job>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Job>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Job>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new `pending` job with zero progress.
    pub fn create_job(&self, job_type: JobType) -> Job {
        let job = Job::new(job_type);
        self.write().insert(job.id.clone(), job.clone());
        metrics::record_job_created(job_type.as_str());
        debug!("Created {} job {}", job_type, job.id);
        job
    }

    pub fn get_job(&self, id: &str) -> Option<Job> {
        self.read().get(id).cloned()
    }

    /// Apply `mutator` to the job atomically.
    ///
    /// The mutation runs on a copy and is committed only if the resulting
    /// status is a legal forward move. `started_at` and `completed_at` are
    /// owned by the registry and set exactly once, on entering `running` and a
    /// terminal status respectively.
    pub fn update_job<F>(&self, id: &str, mutator: F) -> CoreResult<Job>
    where
        F: FnOnce(&mut Job),
    {
        let mut jobs = self.write();
        let current = jobs
            .get_mut(id)
            .ok_or_else(|| CoreError::not_found("job", id))?;

        if current.status.is_terminal() {
            return Err(CoreError::InvalidState(format!(
                "job {} is already {}",
                id, current.status
            )));
        }

        let mut next = current.clone();
        mutator(&mut next);

        if next.status.rank() < current.status.rank() {
            return Err(CoreError::InvalidState(format!(
                "job {} cannot move from {} to {}",
                id, current.status, next.status
            )));
        }

        // Identity and timestamps are not writable through the mutator.
        next.id = current.id.clone();
        next.job_type = current.job_type;
        next.created_at = current.created_at;
        next.cancel_token = current.cancel_token.clone();
        next.started_at = current.started_at;
        next.completed_at = None;
        next.progress = next.progress.min(100);

        let now = Utc::now();
        if next.status != JobStatus::Pending && next.started_at.is_none() {
            next.started_at = Some(now);
        }
        if next.status.is_terminal() {
            next.completed_at = Some(now);
            if next.status == JobStatus::Completed {
                next.progress = 100;
            }
            metrics::record_job_finished(next.job_type.as_str(), next.status.as_str());
            info!(
                "Job {} ({}) finished as {}",
                next.id, next.job_type, next.status
            );
        }

        *current = next.clone();
        Ok(next)
    }

    /// Request cancellation of a job.
    ///
    /// A `pending` job has no worker yet, so it is moved to `cancelled`
    /// directly. A `running` job only receives the signal; its worker records
    /// the outcome. Cancelling a finished job is a no-op.
    pub fn cancel_job(&self, id: &str) -> CoreResult<()> {
        let status = {
            let jobs = self.read();
            let job = jobs.get(id).ok_or_else(|| CoreError::not_found("job", id))?;
            if job.status.is_terminal() {
                return Ok(());
            }
            job.cancel_token.cancel();
            job.status
        };

        if status == JobStatus::Pending {
            match self.update_job(id, |job| {
                if job.status == JobStatus::Pending {
                    job.status = JobStatus::Cancelled;
                    job.message = Some("Cancelled before start".to_string());
                }
            }) {
                // Lost a race with a worker finishing the job.
                Ok(_) | Err(CoreError::InvalidState(_)) => {}
                Err(e) => return Err(e),
            }
        }
        info!("Cancellation requested for job {}", id);
        Ok(())
    }

    /// Snapshot of every job, in no particular order.
    pub fn list_jobs(&self) -> Vec<Job> {
        self.read().values().cloned().collect()
    }

    /// Drop jobs older than `max_age` that are not `running`.
    pub fn cleanup_old_jobs(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut jobs = self.write();
        let before = jobs.len();
        jobs.retain(|_, job| job.status == JobStatus::Running || job.created_at >= cutoff);
        let removed = before - jobs.len();
        if removed > 0 {
            info!("Evicted {} old jobs", removed);
        }
        removed
    }

    pub fn is_cancellation_requested(&self, id: &str) -> bool {
        self.read()
            .get(id)
            .map(|job| job.is_cancellation_requested())
            .unwrap_or(false)
    }

    pub fn count_by_status(&self) -> HashMap<JobStatus, usize> {
        let mut counts = HashMap::new();
        for job in self.read().values() {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        counts
    }

    // Convenience mutators used by workers.

    pub fn mark_running(&self, id: &str, message: impl Into<String>) -> CoreResult<Job> {
        let message = message.into();
        self.update_job(id, |job| {
            job.status = JobStatus::Running;
            job.message = Some(message);
        })
    }

    pub fn set_progress(&self, id: &str, progress: u8) -> CoreResult<Job> {
        self.update_job(id, |job| job.progress = progress)
    }

    pub fn complete(
        &self,
        id: &str,
        message: impl Into<String>,
        result: Option<serde_json::Value>,
    ) -> CoreResult<Job> {
        let message = message.into();
        self.update_job(id, |job| {
            job.status = JobStatus::Completed;
            job.message = Some(message);
            job.result = result;
        })
    }

    pub fn fail(&self, id: &str, error: impl Into<String>) -> CoreResult<Job> {
        let error = error.into();
        self.update_job(id, |job| {
            job.status = JobStatus::Failed;
            job.error = Some(error);
        })
    }

    pub fn mark_cancelled(&self, id: &str) -> CoreResult<Job> {
        self.update_job(id, |job| {
            job.status = JobStatus::Cancelled;
            job.message = Some("Cancelled".to_string());
        })
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, id: &str, age: Duration) {
        if let Some(job) = self.write().get_mut(id) {
            job.created_at = Utc::now() - age;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_job_is_pending() {
        let registry = JobRegistry::new();
        let job = registry.create_job(JobType::Download);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0);
        assert!(job.started_at.is_none());
        assert!(job.completed_at.is_none());

        let fetched = registry.get_job(&job.id).unwrap();
        assert_eq!(fetched.id, job.id);
        assert_eq!(fetched.job_type, JobType::Download);
    }

    #[test]
    fn test_get_unknown_job() {
        let registry = JobRegistry::new();
        assert!(registry.get_job("missing").is_none());
    }

    #[test]
    fn test_update_unknown_job() {
        let registry = JobRegistry::new();
        let err = registry.update_job("missing", |_| {}).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_timestamps_set_once() {
        let registry = JobRegistry::new();
        let job = registry.create_job(JobType::Maintenance);

        let running = registry.mark_running(&job.id, "working").unwrap();
        let started_at = running.started_at.unwrap();
        assert!(running.completed_at.is_none());

        let running = registry.set_progress(&job.id, 40).unwrap();
        assert_eq!(running.started_at, Some(started_at));

        let done = registry.complete(&job.id, "done", None).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress, 100);
        assert_eq!(done.started_at, Some(started_at));
        assert!(done.completed_at.is_some());
    }

    #[test]
    fn test_mutator_cannot_forge_timestamps() {
        let registry = JobRegistry::new();
        let job = registry.create_job(JobType::Maintenance);
        let updated = registry
            .update_job(&job.id, |j| {
                j.completed_at = Some(Utc::now());
                j.progress = 250;
            })
            .unwrap();
        assert!(updated.completed_at.is_none());
        assert_eq!(updated.progress, 100);
    }

    #[test]
    fn test_terminal_status_is_sticky() {
        let registry = JobRegistry::new();
        let job = registry.create_job(JobType::Download);
        registry.mark_running(&job.id, "go").unwrap();
        registry.mark_cancelled(&job.id).unwrap();

        let err = registry.complete(&job.id, "late", None).unwrap_err();
        assert!(matches!(err, CoreError::InvalidState(_)));
        assert_eq!(
            registry.get_job(&job.id).unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[test]
    fn test_backward_transition_rejected() {
        let registry = JobRegistry::new();
        let job = registry.create_job(JobType::Download);
        registry.mark_running(&job.id, "go").unwrap();
        let err = registry
            .update_job(&job.id, |j| j.status = JobStatus::Pending)
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidState(_)));
    }

    #[test]
    fn test_cancel_pending_job() {
        let registry = JobRegistry::new();
        let job = registry.create_job(JobType::CatalogRefresh);
        registry.cancel_job(&job.id).unwrap();

        let job = registry.get_job(&job.id).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.completed_at.is_some());
        assert!(registry.is_cancellation_requested(&job.id));
    }

    #[test]
    fn test_cancel_running_job_only_signals() {
        let registry = JobRegistry::new();
        let job = registry.create_job(JobType::Download);
        registry.mark_running(&job.id, "go").unwrap();

        registry.cancel_job(&job.id).unwrap();
        let snapshot = registry.get_job(&job.id).unwrap();
        assert_eq!(snapshot.status, JobStatus::Running);
        assert!(snapshot.is_cancellation_requested());

        registry.mark_cancelled(&job.id).unwrap();
        assert_eq!(
            registry.get_job(&job.id).unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[test]
    fn test_cancel_finished_job_is_noop() {
        let registry = JobRegistry::new();
        let job = registry.create_job(JobType::Download);
        registry.fail(&job.id, "boom").unwrap();

        registry.cancel_job(&job.id).unwrap();
        let job = registry.get_job(&job.id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_cancel_unknown_job() {
        let registry = JobRegistry::new();
        assert!(registry.cancel_job("missing").unwrap_err().is_not_found());
    }

    #[test]
    fn test_cleanup_old_jobs() {
        let registry = JobRegistry::new();
        let old_done = registry.create_job(JobType::Download);
        let old_running = registry.create_job(JobType::Download);
        let old_pending = registry.create_job(JobType::Download);
        let fresh = registry.create_job(JobType::Download);

        registry.complete(&old_done.id, "ok", None).unwrap();
        registry.mark_running(&old_running.id, "go").unwrap();
        for id in [&old_done.id, &old_running.id, &old_pending.id] {
            registry.backdate(id, Duration::hours(2));
        }

        let removed = registry.cleanup_old_jobs(Duration::hours(1));
        assert_eq!(removed, 2);
        assert!(registry.get_job(&old_done.id).is_none());
        assert!(registry.get_job(&old_pending.id).is_none());
        assert!(registry.get_job(&old_running.id).is_some());
        assert!(registry.get_job(&fresh.id).is_some());
    }

    #[test]
    fn test_count_by_status() {
        let registry = JobRegistry::new();
        let a = registry.create_job(JobType::Download);
        registry.create_job(JobType::Download);
        registry.mark_running(&a.id, "go").unwrap();

        let counts = registry.count_by_status();
        assert_eq!(counts.get(&JobStatus::Pending), Some(&1));
        assert_eq!(counts.get(&JobStatus::Running), Some(&1));
        assert_eq!(registry.list_jobs().len(), 2);
    }
}
