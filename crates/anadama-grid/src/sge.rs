//! The SGE driver: `qsub -terse` submission and `qstat` polling.
//!
//! SGE drops finished jobs from the queue view instead of reporting a
//! terminal state, so the shared worker falls back to the script's rc
//! file once a job disappears; stderr parsing covers the resource-limit
//! kills (`h_vmem`, `h_rt`) that arrive as plain `Killed` messages.

use std::{fs, time::Duration};

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::info;

use crate::queue::{run_backend_command, GridError, GridQueue, GridScript, QueueStatus, ScriptRequest};

const JOB_CODE_FAILED: &str = "FAILED";
const JOB_CODE_TIMEOUT: &str = "TIMEOUT";
const JOB_CODE_MEMKILL: &str = "MEMKILL";

pub struct SgeQueue {
    partition: String,
    options: Vec<String>,
    environment: Vec<String>,
    refresh_rate: Duration,
}

impl SgeQueue {
    pub fn new(partition: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            options: Vec::new(),
            environment: Vec::new(),
            refresh_rate: Duration::from_secs(10),
        }
    }

    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.options = options;
        self
    }

    pub fn with_environment(mut self, environment: Vec<String>) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_refresh_rate(mut self, refresh_rate: Duration) -> Self {
        self.refresh_rate = refresh_rate;
        self
    }

    fn render_script(&self, request: &ScriptRequest, paths: &GridScript) -> String {
        let partition = request
            .resources
            .partition
            .as_deref()
            .unwrap_or(&self.partition);
        let mut lines = vec![
            "#!/bin/bash".to_owned(),
            format!("#$ -N task{}", request.task_no),
            format!("#$ -q {partition}"),
            format!("#$ -pe smp {}", request.resources.cores),
            format!("#$ -l h_rt={}", minutes_to_hms(request.resources.time_minutes)),
            format!("#$ -l m_mem_free={}M", request.resources.mem_mb.max(1)),
            format!("#$ -o {}", paths.stdout_path),
            format!("#$ -e {}", paths.stderr_path),
            "#$ -cwd".to_owned(),
            "#$ -V".to_owned(),
        ];
        lines.extend(self.options.iter().map(|opt| format!("#$ {opt}")));
        lines.extend(self.environment.iter().cloned());
        lines.push(String::new());
        lines.push(request.command.clone());
        lines.push(format!("echo $? > {}", paths.rc_path));
        lines.push(String::new());
        lines.join("\n")
    }
}

#[async_trait]
impl GridQueue for SgeQueue {
    fn name(&self) -> &str {
        "sge"
    }

    fn refresh_rate(&self) -> Duration {
        self.refresh_rate
    }

    async fn create_grid_script(&self, request: &ScriptRequest) -> Result<GridScript, GridError> {
        let base = request.tmpdir.join(format!("sge_task{}", request.task_no));
        let mut n = 0u32;
        let paths = loop {
            let script_path = if n == 0 {
                base.with_extension("sh")
            } else {
                base.with_extension(format!("{n}.sh"))
            };
            if !script_path.as_std_path().exists() {
                let stem = script_path.with_extension("");
                break GridScript {
                    submit_args: Vec::new(),
                    stdout_path: stem.with_extension("out"),
                    stderr_path: stem.with_extension("err"),
                    rc_path: stem.with_extension("rc"),
                    script_path,
                };
            }
            n += 1;
        };
        let body = self.render_script(request, &paths);
        fs::write(paths.script_path.as_std_path(), body).map_err(|source| GridError::Script {
            path: paths.script_path.clone(),
            source,
        })?;
        Ok(GridScript {
            submit_args: vec![
                "qsub".to_owned(),
                "-terse".to_owned(),
                paths.script_path.to_string(),
            ],
            ..paths
        })
    }

    async fn submit(&self, script: &GridScript) -> Result<String, GridError> {
        let stdout = run_backend_command(&script.submit_args).await?;
        let job_id = stdout.split_whitespace().next().unwrap_or_default();
        if job_id.chars().all(|c| c.is_ascii_digit()) && !job_id.is_empty() {
            Ok(job_id.to_owned())
        } else {
            Err(GridError::Submit(format!(
                "no job id in qsub output: {stdout}"
            )))
        }
    }

    async fn refresh_queue_status(&self) -> Result<Vec<QueueStatus>, GridError> {
        let stdout = run_backend_command(&[
            "qstat".to_owned(),
            "-u".to_owned(),
            "*".to_owned(),
        ])
        .await?;
        Ok(parse_qstat(&stdout))
    }

    fn job_failed(&self, status: &str) -> bool {
        matches!(status, JOB_CODE_FAILED | JOB_CODE_TIMEOUT | JOB_CODE_MEMKILL)
    }

    fn job_stopped(&self, status: &str) -> bool {
        status == "COMPLETED" || self.job_failed(status)
    }

    fn job_memkill(&self, status: &str, _job_id: &str, _mem_mb: u64) -> bool {
        status == JOB_CODE_MEMKILL
    }

    fn job_timeout(&self, status: &str, _job_id: &str, _time_minutes: u64) -> bool {
        status == JOB_CODE_TIMEOUT
    }

    async fn job_status_from_stderr(
        &self,
        stderr_path: &Utf8Path,
        current_status: String,
        job_id: &str,
    ) -> String {
        let Ok(text) = fs::read_to_string(stderr_path.as_std_path()) else {
            return current_status;
        };
        classify_sge_stderr(&text, current_status, job_id)
    }
}

fn minutes_to_hms(minutes: u64) -> String {
    format!("{:02}:{:02}:00", minutes / 60, minutes % 60)
}

/// Parse `qstat` tabular output into engine statuses. Jobs missing from
/// the listing have left the queue; the worker resolves those through
/// the rc file.
fn parse_qstat(stdout: &str) -> Vec<QueueStatus> {
    stdout
        .lines()
        .skip(2)
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let job_id = tokens.first()?;
            if !job_id.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            let state = tokens.get(4).copied().unwrap_or_default();
            Some(QueueStatus::new(*job_id, translate_state(state)))
        })
        .collect()
}

fn translate_state(state: &str) -> &'static str {
    if state.contains('E') {
        JOB_CODE_FAILED
    } else if state.contains('d') {
        "CANCELLED"
    } else if state.contains('r') || state.contains('t') {
        "RUNNING"
    } else {
        "PENDING"
    }
}

fn classify_sge_stderr(text: &str, current_status: String, job_id: &str) -> String {
    let lowered = text.to_lowercase();
    if !lowered.contains("killed") {
        return current_status;
    }
    if lowered.contains("h_rt") || lowered.contains("time limit") {
        info!(job_id, "sge task killed due to time limit");
        return JOB_CODE_TIMEOUT.to_owned();
    }
    if lowered.contains("h_vmem") || lowered.contains("m_mem_free") || lowered.contains("memory") {
        info!(job_id, "sge task killed due to memory limit");
        return JOB_CODE_MEMKILL.to_owned();
    }
    current_status
}
