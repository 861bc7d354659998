//! Data models for the download queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const DEFAULT_PRIORITY: i32 = 5;

/// Status of a download record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Pending,
    Queued,
    InProgress,
    Completed, // terminal
    Failed,    // terminal
    Cancelled, // terminal
}

impl DownloadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Failed | DownloadStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Queued => "queued",
            DownloadStatus::InProgress => "in_progress",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DownloadStatus::Pending),
            "queued" => Some(DownloadStatus::Queued),
            "in_progress" => Some(DownloadStatus::InProgress),
            "completed" => Some(DownloadStatus::Completed),
            "failed" => Some(DownloadStatus::Failed),
            "cancelled" => Some(DownloadStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadFormat {
    Mp3,
    Flac,
    Alac,
}

impl DownloadFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadFormat::Mp3 => "mp3",
            DownloadFormat::Flac => "flac",
            DownloadFormat::Alac => "alac",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mp3" => Some(DownloadFormat::Mp3),
            "flac" => Some(DownloadFormat::Flac),
            "alac" => Some(DownloadFormat::Alac),
            _ => None,
        }
    }

    pub fn file_extension(&self) -> &'static str {
        match self {
            DownloadFormat::Mp3 => "mp3",
            DownloadFormat::Flac => "flac",
            DownloadFormat::Alac => "m4a",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadQuality {
    #[default]
    Standard,
    Hd,
    Lossless,
}

impl DownloadQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadQuality::Standard => "standard",
            DownloadQuality::Hd => "hd",
            DownloadQuality::Lossless => "lossless",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "standard" => Some(DownloadQuality::Standard),
            "hd" => Some(DownloadQuality::Hd),
            "lossless" => Some(DownloadQuality::Lossless),
            _ => None,
        }
    }

    /// Relative transfer size used by the progress estimate.
    pub fn size_factor(&self) -> u32 {
        match self {
            DownloadQuality::Standard => 1,
            DownloadQuality::Hd => 2,
            DownloadQuality::Lossless => 4,
        }
    }
}

/// A request to acquire one show in one format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub show_id: String,
    pub format: DownloadFormat,
    /// Defaults to [`DownloadQuality::Standard`].
    pub quality: Option<DownloadQuality>,
    /// Defaults to [`DEFAULT_PRIORITY`].
    pub priority: Option<i32>,
}

/// A persisted download and its queue/execution state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub id: String,
    pub show_id: String,
    pub format: DownloadFormat,
    pub quality: DownloadQuality,
    /// Stored for callers; dequeue order is by `queue_position` only.
    pub priority: i32,
    pub status: DownloadStatus,
    /// Set while queued, cleared once execution starts or the record ends.
    pub queue_position: Option<i64>,
    /// Job tracking the current execution, if one was started.
    pub job_id: Option<String>,
    pub file_path: Option<String>,
    pub file_size: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DownloadRecord {
    /// A new `queued` record. The store assigns `queue_position`.
    pub fn new(request: &DownloadRequest) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            show_id: request.show_id.clone(),
            format: request.format,
            quality: request.quality.unwrap_or_default(),
            priority: request.priority.unwrap_or(DEFAULT_PRIORITY),
            status: DownloadStatus::Queued,
            queue_position: None,
            job_id: None,
            file_path: None,
            file_size: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// Result of an enqueue attempt.
#[derive(Debug, Clone)]
pub enum EnqueueOutcome {
    Queued(DownloadRecord),
    /// A non-terminal record already exists for the same show/format/quality.
    Duplicate { existing_id: String },
}

/// Aggregate counts over the downloads table.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DownloadStats {
    pub by_status: BTreeMap<String, usize>,
    pub by_format: BTreeMap<String, usize>,
    pub by_quality: BTreeMap<String, usize>,
    /// Records in `queued` status.
    pub queue_length: usize,
    /// Downloads executing in this process.
    pub active_count: usize,
    pub max_concurrent: usize,
}
