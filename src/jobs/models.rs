use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    CatalogRefresh,
    Download,
    MonitorCheck,
    Maintenance,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::CatalogRefresh => "catalog_refresh",
            JobType::Download => "download",
            JobType::MonitorCheck => "monitor_check",
            JobType::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job lifecycle: `Pending -> Running -> {Completed | Failed | Cancelled}`.
///
/// The three terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Position in the state machine. Terminal states share the last rank.
    pub(crate) fn rank(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Running => 1,
            _ => 2,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of asynchronous work and its observable state.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    /// 0 to 100.
    pub progress: u8,
    pub message: Option<String>,
    pub error: Option<String>,
    /// Opaque payload produced by the worker.
    pub result: Option<serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub(crate) cancel_token: CancellationToken,
}

impl Job {
    pub(crate) fn new(job_type: JobType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_type,
            status: JobStatus::Pending,
            progress: 0,
            message: None,
            error: None,
            result: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
            cancel_token: CancellationToken::new(),
        }
    }

    /// Token a worker selects on to observe cancellation.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_serializes_read_model() {
        let job = Job::new(JobType::CatalogRefresh);
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["type"], "catalog_refresh");
        assert_eq!(value["status"], "pending");
        assert_eq!(value["progress"], 0);
        assert!(value.get("cancel_token").is_none());
    }

    #[test]
    fn test_clones_share_cancellation() {
        let job = Job::new(JobType::Download);
        let snapshot = job.clone();
        job.cancellation_token().cancel();
        assert!(snapshot.is_cancellation_requested());
    }
}
