//! The driver contract between the engine and a batch system.
//!
//! A driver knows how to materialise a job script, submit it, poll the
//! queue, and classify terminal states. The worker state machine in
//! [`crate::worker`] is shared across drivers.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::resources::GridResources;

#[derive(Debug, Error)]
pub enum GridError {
    #[error("unable to write grid script `{path}`: {source}")]
    Script {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
    #[error("grid submission failed: {0}")]
    Submit(String),
    #[error("grid command `{command}` failed: {message}")]
    Command { command: String, message: String },
    #[error(transparent)]
    Transport(#[from] crate::transport::TransportError),
}

/// One row of queue state for a job.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueStatus {
    pub job_id: String,
    pub status: String,
    pub cpus: Option<u32>,
    pub elapsed: Option<String>,
    pub max_rss_mb: Option<f64>,
}

impl QueueStatus {
    pub fn new(job_id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            status: status.into(),
            cpus: None,
            elapsed: None,
            max_rss_mb: None,
        }
    }
}

/// Everything a driver needs to build a job script for one attempt.
#[derive(Debug, Clone)]
pub struct ScriptRequest {
    pub task_no: usize,
    pub name: String,
    /// The command the job runs (usually a work-unit invocation).
    pub command: String,
    pub resources: GridResources,
    pub tmpdir: Utf8PathBuf,
}

/// A materialised, submittable job.
#[derive(Debug, Clone)]
pub struct GridScript {
    /// argv of the submission command, e.g. `["sbatch", "<path>"]`.
    pub submit_args: Vec<String>,
    pub script_path: Utf8PathBuf,
    pub stdout_path: Utf8PathBuf,
    pub stderr_path: Utf8PathBuf,
    pub rc_path: Utf8PathBuf,
}

#[async_trait]
pub trait GridQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Seconds between queue polls.
    fn refresh_rate(&self) -> Duration {
        Duration::from_secs(10)
    }

    /// Write the script (or request) that, when submitted, puts the job
    /// on the queue.
    async fn create_grid_script(&self, request: &ScriptRequest) -> Result<GridScript, GridError>;

    /// Submit and return the backend job id. Errors here are submission
    /// failures and are not retried.
    async fn submit(&self, script: &GridScript) -> Result<String, GridError>;

    /// Poll the backend for the state of all of this user's jobs.
    async fn refresh_queue_status(&self) -> Result<Vec<QueueStatus>, GridError>;

    /// Whether `status` is a terminal failure.
    fn job_failed(&self, status: &str) -> bool;

    /// Whether `status` means the job is off the queue, success or not.
    fn job_stopped(&self, status: &str) -> bool;

    fn job_memkill(&self, status: &str, job_id: &str, mem_mb: u64) -> bool;

    fn job_timeout(&self, status: &str, job_id: &str, time_minutes: u64) -> bool;

    /// Upgrade a generic failure by reading backend-specific stderr
    /// output (OOM killer lines, scheduler cancellations). The default
    /// keeps the status as reported.
    async fn job_status_from_stderr(
        &self,
        _stderr_path: &Utf8Path,
        current_status: String,
        _job_id: &str,
    ) -> String {
        current_status
    }
}

/// Shared, rate-limited view of the queue. Polling and submission
/// interleave across worker threads, so the status map sits behind a
/// mutex and refreshes at the driver's pace with bounded retry on
/// transient poll failures.
pub struct GridMonitor {
    queue: std::sync::Arc<dyn GridQueue>,
    inner: tokio::sync::Mutex<MonitorState>,
}

struct MonitorState {
    statuses: HashMap<String, QueueStatus>,
    last_refresh: Option<Instant>,
}

const REFRESH_ATTEMPTS: u32 = 3;

impl GridMonitor {
    pub fn new(queue: std::sync::Arc<dyn GridQueue>) -> Self {
        Self {
            queue,
            inner: tokio::sync::Mutex::new(MonitorState {
                statuses: HashMap::new(),
                last_refresh: None,
            }),
        }
    }

    /// Latest known status for `job_id`, refreshing from the backend if
    /// the cached view is older than the driver's refresh rate. Poll
    /// failures are tolerated up to a bound; stale data is served with a
    /// warning rather than failing the task.
    pub async fn status_of(&self, job_id: &str) -> Option<QueueStatus> {
        let mut state = self.inner.lock().await;
        let stale = state
            .last_refresh
            .map(|at| at.elapsed() >= self.queue.refresh_rate())
            .unwrap_or(true);
        if stale {
            match self.refresh().await {
                Ok(rows) => {
                    state.statuses = rows
                        .into_iter()
                        .map(|row| (row.job_id.clone(), row))
                        .collect();
                    state.last_refresh = Some(Instant::now());
                }
                Err(e) => {
                    warn!(queue = self.queue.name(), error = %e, "queue poll failed, serving stale status");
                }
            }
        }
        state.statuses.get(job_id).cloned()
    }

    async fn refresh(&self) -> Result<Vec<QueueStatus>, GridError> {
        let mut last_err = None;
        for attempt in 0..REFRESH_ATTEMPTS {
            match self.queue.refresh_queue_status().await {
                Ok(rows) => {
                    debug!(queue = self.queue.name(), jobs = rows.len(), "queue refreshed");
                    return Ok(rows);
                }
                Err(e) => {
                    debug!(queue = self.queue.name(), attempt, error = %e, "queue poll attempt failed");
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_millis(250 * (attempt as u64 + 1))).await;
                }
            }
        }
        Err(last_err.expect("at least one refresh attempt"))
    }
}

/// Run an argv-style backend command, capturing stdout. Non-zero exits
/// become [`GridError::Command`].
pub(crate) async fn run_backend_command(args: &[String]) -> Result<String, GridError> {
    let command = args.join(" ");
    let output = tokio::process::Command::new(&args[0])
        .args(&args[1..])
        .output()
        .await
        .map_err(|e| GridError::Command {
            command: command.clone(),
            message: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(GridError::Command {
            command,
            message: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
