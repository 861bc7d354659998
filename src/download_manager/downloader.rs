//! The out-of-process downloader.
//!
//! The core only observes the process's exit status and how long it took; no
//! progress protocol is consumed.

use super::models::{DownloadFormat, DownloadQuality};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lines of stderr kept for the failure message.
const STDERR_TAIL_LINES: usize = 5;

#[derive(Debug, Clone)]
pub struct DownloadSpec {
    pub download_id: String,
    pub show_id: String,
    pub format: DownloadFormat,
    pub quality: DownloadQuality,
    pub output_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadOutput {
    pub file_path: PathBuf,
    pub file_size: u64,
}

#[derive(Debug, Error)]
pub enum DownloadProcessError {
    #[error("downloader could not be started: {0}")]
    Spawn(String),

    #[error("downloader failed: {0}")]
    Failed(String),

    #[error("download cancelled")]
    Cancelled,
}

#[async_trait]
pub trait DownloadProcess: Send + Sync {
    /// Run one download to completion.
    ///
    /// Must return [`DownloadProcessError::Cancelled`] promptly once `cancel`
    /// fires, terminating any child process it started.
    async fn run(
        &self,
        spec: &DownloadSpec,
        cancel: CancellationToken,
    ) -> Result<DownloadOutput, DownloadProcessError>;
}

/// Runs a configured executable as
/// `<program> --show <id> --format <fmt> --quality <q> --output <path>`.
pub struct CommandDownloadProcess {
    program: String,
}

impl CommandDownloadProcess {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl DownloadProcess for CommandDownloadProcess {
    async fn run(
        &self,
        spec: &DownloadSpec,
        cancel: CancellationToken,
    ) -> Result<DownloadOutput, DownloadProcessError> {
        if let Some(parent) = spec.output_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadProcessError::Spawn(format!("{:?}: {}", parent, e)))?;
        }

        let mut cmd = Command::new(&self.program);
        cmd.arg("--show")
            .arg(&spec.show_id)
            .arg("--format")
            .arg(spec.format.as_str())
            .arg("--quality")
            .arg(spec.quality.as_str())
            .arg("--output")
            .arg(&spec.output_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| DownloadProcessError::Spawn(format!("{}: {}", self.program, e)))?;
        info!(
            "Started downloader for {} (pid {:?})",
            spec.download_id,
            child.id()
        );

        let stderr_tail = child.stderr.take().map(|stderr| {
            let download_id = spec.download_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                let mut tail: Vec<String> = Vec::new();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "downloader", download_id = %download_id, "{}", line);
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.remove(0);
                    }
                    tail.push(line);
                }
                tail.join("\n")
            })
        });

        let status = tokio::select! {
            status = child.wait() => status
                .map_err(|e| DownloadProcessError::Failed(e.to_string()))?,
            _ = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill downloader for {}: {}", spec.download_id, e);
                }
                return Err(DownloadProcessError::Cancelled);
            }
        };

        let stderr = match stderr_tail {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            let reason = if stderr.is_empty() {
                format!("exited with {}", status)
            } else {
                format!("exited with {}: {}", status, stderr)
            };
            return Err(DownloadProcessError::Failed(reason));
        }

        let metadata = tokio::fs::metadata(&spec.output_path).await.map_err(|_| {
            DownloadProcessError::Failed(format!(
                "exited successfully but produced no file at {:?}",
                spec.output_path
            ))
        })?;

        Ok(DownloadOutput {
            file_path: spec.output_path.clone(),
            file_size: metadata.len(),
        })
    }
}
