//! The SLURM driver: `sbatch` submission, `sacct` polling, and
//! `slurmstepd` stderr parsing to tell memory kills and timeouts apart
//! from garden-variety failures.

use std::{fs, sync::OnceLock, time::Duration};

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use tracing::info;

use crate::queue::{run_backend_command, GridError, GridQueue, GridScript, QueueStatus, ScriptRequest};

const JOB_CODE_COMPLETED: &str = "COMPLETED";
const JOB_CODE_CANCELLED: &str = "CANCELLED";
const JOB_CODE_FAILED: &str = "FAILED";
const JOB_CODE_TIMEOUT: &str = "TIMEOUT";
const JOB_CODE_MEMKILL: &str = "MEMKILL";

pub struct SlurmQueue {
    partition: String,
    /// Extra `#SBATCH` options, one per line, without the prefix.
    options: Vec<String>,
    /// Environment setup commands inserted before the task command.
    environment: Vec<String>,
    refresh_rate: Duration,
}

impl SlurmQueue {
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
            format!("#SBATCH -p {partition}"),
            "#SBATCH -N 1".to_owned(),
            format!("#SBATCH -n {}", request.resources.cores),
            format!("#SBATCH -t {}", request.resources.time_minutes),
            format!("#SBATCH --mem {}", request.resources.mem_mb),
            format!("#SBATCH -o {}", paths.stdout_path),
            format!("#SBATCH -e {}", paths.stderr_path),
        ];
        lines.extend(self.options.iter().map(|opt| format!("#SBATCH {opt}")));
        lines.extend(self.environment.iter().cloned());
        lines.push(String::new());
        lines.push(request.command.clone());
        lines.push(format!("echo $? > {}", paths.rc_path));
        lines.push(String::new());
        lines.join("\n")
    }
}

#[async_trait]
impl GridQueue for SlurmQueue {
    fn name(&self) -> &str {
        "slurm"
    }

    fn refresh_rate(&self) -> Duration {
        self.refresh_rate
    }

    async fn create_grid_script(&self, request: &ScriptRequest) -> Result<GridScript, GridError> {
        let base = request
            .tmpdir
            .join(format!("slurm_task{}", request.task_no));
        let paths = GridScript {
            submit_args: Vec::new(),
            script_path: unique_with_extension(&base, "sh"),
            stdout_path: unique_with_extension(&base, "out"),
            stderr_path: unique_with_extension(&base, "err"),
            rc_path: unique_with_extension(&base, "rc"),
        };
        let body = self.render_script(request, &paths);
        fs::write(paths.script_path.as_std_path(), body).map_err(|source| GridError::Script {
            path: paths.script_path.clone(),
            source,
        })?;
        Ok(GridScript {
            submit_args: vec!["sbatch".to_owned(), paths.script_path.to_string()],
            ..paths
        })
    }

    async fn submit(&self, script: &GridScript) -> Result<String, GridError> {
        let stdout = run_backend_command(&script.submit_args).await?;
        parse_sbatch_job_id(&stdout)
            .ok_or_else(|| GridError::Submit(format!("no job id in sbatch output: {stdout}")))
    }

    async fn refresh_queue_status(&self) -> Result<Vec<QueueStatus>, GridError> {
        let stdout = run_backend_command(&[
            "sacct".to_owned(),
            "-o".to_owned(),
            "JobID,State,AllocCPUs,Elapsed,MaxRSS".to_owned(),
        ])
        .await?;
        Ok(parse_sacct(&stdout))
    }

    fn job_failed(&self, status: &str) -> bool {
        // Captures both "CANCELLED by 0" and the short form "CANCELLED+"
        status.starts_with(JOB_CODE_CANCELLED)
            || matches!(
                status,
                JOB_CODE_FAILED | JOB_CODE_TIMEOUT | JOB_CODE_MEMKILL | JOB_CODE_CANCELLED
            )
    }

    fn job_stopped(&self, status: &str) -> bool {
        status == JOB_CODE_COMPLETED || self.job_failed(status)
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
        classify_slurm_stderr(&text, current_status, job_id)
    }
}

fn unique_with_extension(base: &Utf8Path, ext: &str) -> Utf8PathBuf {
    let mut n = 0u32;
    loop {
        let candidate = if n == 0 {
            base.with_extension(ext)
        } else {
            base.with_extension(format!("{n}.{ext}"))
        };
        if !candidate.as_std_path().exists() {
            return candidate;
        }
        n += 1;
    }
}

fn parse_sbatch_job_id(stdout: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(\d+)").unwrap());
    re.captures(stdout).map(|caps| caps[1].to_owned())
}

/// Parse `sacct` tabular output. The `.batch` step rows carry the final
/// MaxRSS and are merged into their parent job's row.
fn parse_sacct(stdout: &str) -> Vec<QueueStatus> {
    let mut rows: Vec<QueueStatus> = Vec::new();
    for line in stdout.lines().skip(2) {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 2 {
            continue;
        }
        let job_id = tokens[0];
        if !job_id.contains('.') {
            rows.push(QueueStatus {
                job_id: job_id.to_owned(),
                status: tokens[1].to_owned(),
                cpus: tokens.get(2).and_then(|t| t.parse().ok()),
                elapsed: tokens.get(3).map(|t| (*t).to_owned()),
                max_rss_mb: None,
            });
        } else if job_id.contains(".ba") {
            let parent = job_id.split('.').next().unwrap_or_default();
            if let Some(row) = rows.iter_mut().find(|row| row.job_id == parent) {
                row.max_rss_mb = tokens.last().and_then(|t| parse_rss_mb(t));
            }
        }
    }
    rows
}

fn parse_rss_mb(token: &str) -> Option<f64> {
    let token = token.trim();
    if token.is_empty() {
        return None;
    }
    let (number, scale) = match token.chars().last() {
        Some('K') => (&token[..token.len() - 1], 1.0 / 1024.0),
        Some('M') => (&token[..token.len() - 1], 1.0),
        Some('G') => (&token[..token.len() - 1], 1024.0),
        _ => (token, 1.0 / 1024.0 / 1024.0),
    };
    number.parse::<f64>().ok().map(|n| n * scale)
}

fn classify_slurm_stderr(text: &str, current_status: String, job_id: &str) -> String {
    let interesting: Vec<&str> = text
        .lines()
        .filter(|line| line.contains("slurmstepd: error") || line.to_lowercase().contains("killed"))
        .collect();
    if interesting.is_empty() {
        return current_status;
    }

    if interesting
        .iter()
        .any(|line| line.contains("TIME LIMIT") && line.contains(JOB_CODE_CANCELLED))
    {
        info!(job_id, "slurm task cancelled due to time limit");
        return JOB_CODE_TIMEOUT.to_owned();
    }

    let joined = interesting.join("\n").to_lowercase();
    if ["exceeded", "memory limit", "killed"]
        .iter()
        .all(|needle| joined.contains(needle))
    {
        info!(job_id, "slurm task cancelled due to memory limit");
        return JOB_CODE_MEMKILL.to_owned();
    }

    current_status
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;

    #[test]
    fn sbatch_output_yields_the_job_id() {
        assert_eq!(
            parse_sbatch_job_id("Submitted batch job 8675309\n"),
            Some("8675309".to_owned())
        );
        assert_eq!(parse_sbatch_job_id("sbatch: error"), None);
    }

    #[test]
    fn sacct_rows_merge_batch_maxrss() {
        let out = "\
       JobID      State  AllocCPUS    Elapsed     MaxRSS
------------ ---------- ---------- ---------- ----------
        1000  COMPLETED          4   00:10:03
  1000.batch  COMPLETED          4   00:10:03    204800K
        1001    RUNNING          1   00:00:40
";
        let rows = parse_sacct(out);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].job_id, "1000");
        assert_eq!(rows[0].status, "COMPLETED");
        assert_eq!(rows[0].cpus, Some(4));
        assert_eq!(rows[0].max_rss_mb, Some(200.0));
        assert_eq!(rows[1].status, "RUNNING");
        assert_eq!(rows[1].max_rss_mb, None);
    }

    #[test]
    fn cancelled_by_operator_counts_as_failed() {
        let queue = SlurmQueue::new("general");
        assert!(queue.job_failed("CANCELLED by 0"));
        assert!(queue.job_failed("CANCELLED+"));
        assert!(queue.job_stopped("COMPLETED"));
        assert!(!queue.job_failed("RUNNING"));
    }

    #[test_case(
        "slurmstepd: error: *** JOB 42 CANCELLED AT 2020-01-01 DUE TO TIME LIMIT ***",
        "TIMEOUT";
        "time limit"
    )]
    #[test_case(
        "slurmstepd: error: Job 42 exceeded memory limit (3000 > 2048), being killed",
        "MEMKILL";
        "memory limit"
    )]
    #[test_case("some unrelated noise", "FAILED"; "no upgrade")]
    fn stderr_classification(line: &str, expected: &str) {
        assert_eq!(
            classify_slurm_stderr(line, "FAILED".to_owned(), "42"),
            expected
        );
    }

    #[tokio::test]
    async fn script_materialisation_writes_sbatch_headers() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = Utf8PathBuf::from(dir.path().to_str().unwrap());
        let queue = SlurmQueue::new("general")
            .with_options(vec!["--constraint=skylake".to_owned()])
            .with_environment(vec!["module load gcc".to_owned()]);

        let request = ScriptRequest {
            task_no: 3,
            name: "assemble".into(),
            command: "echo run".into(),
            resources: crate::resources::GridResources::new(120, 4096, 8),
            tmpdir: tmp,
        };
        let script = queue.create_grid_script(&request).await.unwrap();
        let body = fs::read_to_string(script.script_path.as_std_path()).unwrap();

        assert!(body.starts_with("#!/bin/bash"));
        assert!(body.contains("#SBATCH -p general"));
        assert!(body.contains("#SBATCH -n 8"));
        assert!(body.contains("#SBATCH -t 120"));
        assert!(body.contains("#SBATCH --mem 4096"));
        assert!(body.contains("#SBATCH --constraint=skylake"));
        assert!(body.contains("module load gcc"));
        assert!(body.contains("echo run"));
        assert!(body.contains(&format!("echo $? > {}", script.rc_path)));
        assert_eq!(script.submit_args[0], "sbatch");
    }
}
