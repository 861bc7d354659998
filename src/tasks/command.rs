//! Catalog refresh and monitor check backed by configured external commands.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::TaskSettings;
use crate::error::{CoreError, CoreResult};
use crate::events::{self, EventHook};
use crate::jobs::{Job, JobRegistry, JobType};
use crate::scheduler::{CatalogRefresher, MonitorChecker};

const OUTPUT_TAIL_LINES: usize = 10;

/// Runs each task as `<command> [args...]` in the background, tracked as a
/// [`Job`]. Cancelling the job kills the process.
pub struct CommandTaskRunner {
    jobs: Arc<JobRegistry>,
    events: Arc<dyn EventHook>,
    settings: Arc<TaskSettings>,
}

impl CommandTaskRunner {
    pub fn new(jobs: Arc<JobRegistry>, events: Arc<dyn EventHook>, settings: TaskSettings) -> Self {
        Self {
            jobs,
            events,
            settings: Arc::new(settings),
        }
    }

    fn spawn(&self, job_type: JobType, command_line: &str, extra_args: &[&str]) -> CoreResult<Job> {
        let mut parts = command_line.split_whitespace();
        let program = parts.next().ok_or_else(|| {
            CoreError::ExecutionFailure(format!("empty {} command", job_type))
        })?;
        let mut command = Command::new(program);
        command
            .args(parts)
            .args(extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let job = self.jobs.create_job(job_type);
        let jobs = self.jobs.clone();
        let events = self.events.clone();
        let job_id = job.id.clone();
        let token = job.cancellation_token();
        let description = command_line.to_string();

        tokio::spawn(async move {
            if jobs
                .mark_running(&job_id, format!("Running {}", description))
                .is_err()
            {
                return;
            }
            let started = Instant::now();

            let outcome = match command.spawn() {
                Ok(mut child) => {
                    let stdout = child.stdout.take().map(|out| tokio::spawn(tail_lines(out)));
                    let stderr = child.stderr.take().map(|err| tokio::spawn(tail_lines(err)));

                    let status = tokio::select! {
                        status = child.wait() => status,
                        _ = token.cancelled() => {
                            if let Err(e) = child.kill().await {
                                warn!("Failed to kill {} job {}: {}", job_type, job_id, e);
                            }
                            info!("{} job {} cancelled", job_type, job_id);
                            let _ = jobs.mark_cancelled(&job_id);
                            return;
                        }
                    };
                    let stdout = join_tail(stdout).await;
                    let stderr = join_tail(stderr).await;

                    match status {
                        Ok(status) if status.success() => Ok((status.code(), stdout)),
                        Ok(status) => Err(format!("{} exited with {}: {}", description, status, stderr)),
                        Err(e) => Err(format!("failed to wait for {}: {}", description, e)),
                    }
                }
                Err(e) => Err(format!("failed to run {}: {}", description, e)),
            };

            let elapsed_ms = started.elapsed().as_millis() as u64;
            match outcome {
                Ok((exit_code, output)) => {
                    let result = json!({
                        "exit_code": exit_code,
                        "duration_ms": elapsed_ms,
                        "output": output,
                    });
                    info!("{} job {} completed in {}ms", job_type, job_id, elapsed_ms);
                    if let Err(e) = jobs.complete(&job_id, "Completed", Some(result.clone())) {
                        warn!("Could not complete job {}: {}", job_id, e);
                        return;
                    }
                    if job_type == JobType::CatalogRefresh {
                        events.emit(
                            events::CATALOG_REFRESH_COMPLETED,
                            json!({ "job_id": job_id, "result": result }),
                        );
                    }
                }
                Err(message) => {
                    error!("{} job {} failed: {}", job_type, job_id, message);
                    if let Err(e) = jobs.fail(&job_id, message.clone()) {
                        warn!("Could not fail job {}: {}", job_id, e);
                        return;
                    }
                    if job_type == JobType::CatalogRefresh {
                        events.emit(
                            events::CATALOG_REFRESH_FAILED,
                            json!({ "job_id": job_id, "error": message }),
                        );
                    }
                }
            }
        });

        Ok(job)
    }
}

#[async_trait]
impl CatalogRefresher for CommandTaskRunner {
    async fn start_refresh(&self, force: bool) -> CoreResult<Job> {
        let command = self.settings.catalog_refresh_command.as_deref().ok_or_else(|| {
            CoreError::ExecutionFailure("no catalog refresh command configured".to_string())
        })?;
        let args: &[&str] = if force { &["--force"] } else { &[] };
        self.spawn(JobType::CatalogRefresh, command, args)
    }
}

#[async_trait]
impl MonitorChecker for CommandTaskRunner {
    async fn check_all_monitors(&self) -> CoreResult<Job> {
        let command = self.settings.monitor_check_command.as_deref().ok_or_else(|| {
            CoreError::ExecutionFailure("no monitor check command configured".to_string())
        })?;
        self.spawn(JobType::MonitorCheck, command, &[])
    }
}

/// Read `reader` line by line, keeping only the last lines.
async fn tail_lines<R>(reader: R) -> String
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut tail = VecDeque::with_capacity(OUTPUT_TAIL_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        if tail.len() == OUTPUT_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail).join("\n")
}

async fn join_tail(handle: Option<JoinHandle<String>>) -> String {
    match handle {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BroadcastEventHook;
    use crate::jobs::JobStatus;
    use std::time::Duration;

    fn runner(
        refresh: Option<&str>,
        monitor: Option<&str>,
    ) -> (CommandTaskRunner, Arc<JobRegistry>, Arc<BroadcastEventHook>) {
        let jobs = Arc::new(JobRegistry::new());
        let events = Arc::new(BroadcastEventHook::new(16));
        let settings = TaskSettings {
            catalog_refresh_command: refresh.map(String::from),
            monitor_check_command: monitor.map(String::from),
            ..Default::default()
        };
        (
            CommandTaskRunner::new(jobs.clone(), events.clone(), settings),
            jobs,
            events,
        )
    }

    async fn wait_terminal(jobs: &JobRegistry, id: &str) -> Job {
        for _ in 0..200 {
            let job = jobs.get_job(id).unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {} did not finish", id);
    }

    #[tokio::test]
    async fn test_tail_keeps_last_lines() {
        let text: String = (1..=15).map(|i| format!("line {}\n", i)).collect();
        let tail = tail_lines(text.as_bytes()).await;
        assert!(tail.starts_with("line 6"));
        assert!(tail.ends_with("line 15"));
        assert_eq!(tail.lines().count(), OUTPUT_TAIL_LINES);
    }

    #[tokio::test]
    async fn test_missing_command_is_execution_failure() {
        let (runner, jobs, _) = runner(None, None);
        assert!(matches!(
            runner.start_refresh(false).await,
            Err(CoreError::ExecutionFailure(_))
        ));
        assert!(matches!(
            runner.check_all_monitors().await,
            Err(CoreError::ExecutionFailure(_))
        ));
        assert!(jobs.list_jobs().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_refresh_passes_force_and_emits_completed() {
        let (runner, jobs, events) = runner(Some("echo refreshed"), None);
        let mut rx = events.subscribe();

        let job = runner.start_refresh(true).await.unwrap();
        assert_eq!(job.job_type, JobType::CatalogRefresh);

        let done = wait_terminal(&jobs, &job.id).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(
            done.result.unwrap()["output"].as_str(),
            Some("refreshed --force")
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, events::CATALOG_REFRESH_COMPLETED);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_command_fails_job() {
        let (runner, jobs, events) = runner(Some("false"), Some("false"));
        let mut rx = events.subscribe();

        let job = runner.start_refresh(false).await.unwrap();
        let done = wait_terminal(&jobs, &job.id).await;
        assert_eq!(done.status, JobStatus::Failed);
        assert!(done.error.is_some());
        assert_eq!(rx.recv().await.unwrap().name, events::CATALOG_REFRESH_FAILED);

        let monitor = runner.check_all_monitors().await.unwrap();
        let done = wait_terminal(&jobs, &monitor.id).await;
        assert_eq!(done.status, JobStatus::Failed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_chatty_command_keeps_only_tail() {
        let (runner, jobs, _) = runner(None, Some("seq 1 200000"));
        let job = runner.check_all_monitors().await.unwrap();

        let done = wait_terminal(&jobs, &job.id).await;
        assert_eq!(done.status, JobStatus::Completed);
        let output = done.result.unwrap()["output"].as_str().unwrap().to_string();
        assert_eq!(output.lines().count(), OUTPUT_TAIL_LINES);
        assert!(output.starts_with("199991"));
        assert!(output.ends_with("200000"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_kills_command() {
        let (runner, jobs, _) = runner(None, Some("sleep 30"));
        let job = runner.check_all_monitors().await.unwrap();

        for _ in 0..100 {
            if jobs.get_job(&job.id).unwrap().status == JobStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        jobs.cancel_job(&job.id).unwrap();

        let done = wait_terminal(&jobs, &job.id).await;
        assert_eq!(done.status, JobStatus::Cancelled);
    }
}
