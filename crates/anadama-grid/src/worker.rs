//! The shared grid-worker state machine.
//!
//! One in-flight job per call: submit, poll the queue until the job
//! stops, classify the terminal state, and either reap the result blob
//! or resubmit with scaled resources after a memory kill or timeout.
//!
//! ```text
//! SUBMIT --ok--> QUEUED --poll--> RUNNING --poll--> STOPPED
//!     |                                                |
//!     |                                     SUCCESS  FAILED
//!     |                                        |        |
//!  submission fail                          reap     MEMKILL -> mem x1.3^kills, resubmit
//!   -> FAILED(err)                          result   TIMEOUT -> time x1.5^kills, resubmit
//!                                                    OTHER   -> FAILED(err)
//! ```
//!
//! Retries are bounded by [`GridResources::max_retries`]; exhaustion
//! reports the task failed with the accumulated stderr.

use std::{fs, sync::Arc, time::Duration};

use camino::Utf8Path;
use tracing::debug;

use crate::{
    queue::{GridMonitor, GridQueue, ScriptRequest},
    resources::{scale_memory, scale_time, GridResources},
    transport::{self, WorkResult, WorkUnit},
};

/// How long to wait for the result blob after the queue reports the job
/// stopped; shared filesystems can lag the scheduler.
const REAP_TIMEOUT: Duration = Duration::from_secs(60);

/// Receives job status transitions for reporting. The engine forwards
/// these to its reporter as `task_grid_status` events.
pub type StatusSink<'a> = &'a (dyn Fn(usize, &str, &str) + Send + Sync);

/// Drive one task through the grid to completion. Never returns an
/// `Err`: every failure mode is folded into a failed [`WorkResult`] so
/// the engine's failure propagation stays uniform.
pub async fn execute_on_grid(
    queue: &Arc<dyn GridQueue>,
    monitor: &GridMonitor,
    unit: &WorkUnit,
    resources: &GridResources,
    tmpdir: &Utf8Path,
    on_status: StatusSink<'_>,
) -> WorkResult {
    let mut mem_kills = 0u32;
    let mut time_kills = 0u32;
    let mut accumulated_stderr = String::new();

    loop {
        let attempt = GridResources {
            mem_mb: scale_memory(resources.mem_mb, mem_kills),
            time_minutes: scale_time(resources.time_minutes, time_kills),
            ..resources.clone()
        };

        let files = match transport::materialize(unit, tmpdir) {
            Ok(files) => files,
            Err(e) => return WorkResult::failed(unit.task_no, e.to_string()),
        };
        let request = ScriptRequest {
            task_no: unit.task_no,
            name: unit.name.clone(),
            command: files.run_command(),
            resources: attempt,
            tmpdir: tmpdir.to_owned(),
        };
        let script = match queue.create_grid_script(&request).await {
            Ok(script) => script,
            Err(e) => return WorkResult::failed(unit.task_no, e.to_string()),
        };

        // Submission failures are terminal, no retry
        let job_id = match queue.submit(&script).await {
            Ok(id) => id,
            Err(e) => {
                return WorkResult::failed(
                    unit.task_no,
                    format!("grid submission failed: {e}"),
                )
            }
        };
        on_status(unit.task_no, &job_id, "submitted");
        debug!(task_no = unit.task_no, job_id = %job_id, queue = queue.name(), "job submitted");

        let mut final_status = poll_until_stopped(queue, monitor, unit.task_no, &job_id, &script.rc_path, on_status).await;

        if queue.job_failed(&final_status) {
            final_status = queue
                .job_status_from_stderr(&script.stderr_path, final_status, &job_id)
                .await;
            if let Ok(stderr) = fs::read_to_string(script.stderr_path.as_std_path()) {
                accumulated_stderr.push_str(&stderr);
            }

            let retries_used = mem_kills + time_kills;
            if queue.job_memkill(&final_status, &job_id, request.resources.mem_mb)
                && retries_used < resources.max_retries
            {
                mem_kills += 1;
                on_status(
                    unit.task_no,
                    &job_id,
                    &format!(
                        "killed for memory, resubmitting with {}MB",
                        scale_memory(resources.mem_mb, mem_kills)
                    ),
                );
                continue;
            }
            if queue.job_timeout(&final_status, &job_id, request.resources.time_minutes)
                && retries_used < resources.max_retries
            {
                time_kills += 1;
                on_status(
                    unit.task_no,
                    &job_id,
                    &format!(
                        "timed out, resubmitting with {} minutes",
                        scale_time(resources.time_minutes, time_kills)
                    ),
                );
                continue;
            }

            return WorkResult::failed(
                unit.task_no,
                format!(
                    "grid job {job_id} failed with status {final_status}\n{accumulated_stderr}"
                ),
            );
        }

        // The queue says the job finished; reap the result blob.
        return match transport::collect_result(&files.result_path, REAP_TIMEOUT).await {
            Ok(result) => {
                if let Some(status) = monitor.status_of(&job_id).await {
                    record_usage(unit.task_no, &job_id, &status, on_status);
                }
                result
            }
            Err(e) => WorkResult::failed(
                unit.task_no,
                format!("unable to decode grid task result: {e}\n{accumulated_stderr}"),
            ),
        };
    }
}

async fn poll_until_stopped(
    queue: &Arc<dyn GridQueue>,
    monitor: &GridMonitor,
    task_no: usize,
    job_id: &str,
    rc_path: &Utf8Path,
    on_status: StatusSink<'_>,
) -> String {
    let mut last_reported = String::new();
    loop {
        tokio::time::sleep(queue.refresh_rate()).await;
        match monitor.status_of(job_id).await {
            Some(status) if queue.job_stopped(&status.status) => return status.status,
            Some(status) => {
                if status.status != last_reported {
                    on_status(task_no, job_id, &status.status);
                    last_reported = status.status.clone();
                }
            }
            None => {
                // Backends age completed jobs out of the queue view; the
                // script's rc file is the remaining signal.
                if let Ok(rc) = fs::read_to_string(rc_path.as_std_path()) {
                    let rc = rc.trim();
                    return if rc == "0" { "COMPLETED".into() } else { "FAILED".into() };
                }
            }
        }
    }
}

fn record_usage(task_no: usize, job_id: &str, status: &crate::queue::QueueStatus, on_status: StatusSink<'_>) {
    let cpus = status.cpus.map(|c| c.to_string()).unwrap_or_else(|| "?".into());
    let elapsed = status.elapsed.clone().unwrap_or_else(|| "?".into());
    let rss = status
        .max_rss_mb
        .map(|m| format!("{m:.1}MB"))
        .unwrap_or_else(|| "?".into());
    on_status(
        task_no,
        job_id,
        &format!("final usage: cpus={cpus} elapsed={elapsed} max_rss={rss}"),
    );
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use camino::Utf8PathBuf;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::queue::{GridError, GridScript, QueueStatus};
    use crate::transport::{FunctionRegistry, WireAction};

    /// A scripted backend: submission N terminates with the Nth planned
    /// status; "COMPLETED" submissions execute the work unit in-process
    /// to stand in for the remote node.
    struct FakeQueue {
        plan: Mutex<Vec<&'static str>>,
        submitted_mem: Mutex<Vec<u64>>,
        submitted_time: Mutex<Vec<u64>>,
        jobs: Mutex<Vec<(String, &'static str)>>,
        fail_submission: bool,
    }

    impl FakeQueue {
        fn new(plan: Vec<&'static str>) -> Self {
            Self {
                plan: Mutex::new(plan),
                submitted_mem: Mutex::new(Vec::new()),
                submitted_time: Mutex::new(Vec::new()),
                jobs: Mutex::new(Vec::new()),
                fail_submission: false,
            }
        }
    }

    #[async_trait]
    impl GridQueue for FakeQueue {
        fn name(&self) -> &str {
            "fake"
        }

        fn refresh_rate(&self) -> Duration {
            Duration::from_millis(5)
        }

        async fn create_grid_script(
            &self,
            request: &ScriptRequest,
        ) -> Result<GridScript, GridError> {
            self.submitted_mem.lock().unwrap().push(request.resources.mem_mb);
            self.submitted_time
                .lock()
                .unwrap()
                .push(request.resources.time_minutes);
            let base = request.tmpdir.join(format!(
                "fake_{}_{}",
                request.task_no,
                self.jobs.lock().unwrap().len()
            ));
            Ok(GridScript {
                submit_args: request.command.split(' ').map(str::to_owned).collect(),
                script_path: base.with_extension("sh"),
                stdout_path: base.with_extension("out"),
                stderr_path: base.with_extension("err"),
                rc_path: base.with_extension("rc"),
            })
        }

        async fn submit(&self, script: &GridScript) -> Result<String, GridError> {
            if self.fail_submission {
                return Err(GridError::Submit("queue rejected the job".into()));
            }
            let planned = self.plan.lock().unwrap().remove(0);
            let job_id = format!("job{}", self.jobs.lock().unwrap().len());
            if planned == "COMPLETED" {
                // The submit args are the work-unit invocation; run it
                // here in place of the remote node.
                let unit = Utf8PathBuf::from(&script.submit_args[script.submit_args.len() - 2]);
                let result = Utf8PathBuf::from(&script.submit_args[script.submit_args.len() - 1]);
                transport::run_work_unit_files(&unit, &result, &FunctionRegistry::new()).unwrap();
            } else {
                std::fs::write(script.stderr_path.as_std_path(), "slurmstepd: error: killed\n")
                    .unwrap();
            }
            self.jobs.lock().unwrap().push((job_id.clone(), planned));
            Ok(job_id)
        }

        async fn refresh_queue_status(&self) -> Result<Vec<QueueStatus>, GridError> {
            Ok(self
                .jobs
                .lock()
                .unwrap()
                .iter()
                .map(|(id, status)| QueueStatus {
                    job_id: id.clone(),
                    status: (*status).to_owned(),
                    cpus: Some(1),
                    elapsed: Some("00:00:01".into()),
                    max_rss_mb: Some(12.0),
                })
                .collect())
        }

        fn job_failed(&self, status: &str) -> bool {
            matches!(status, "FAILED" | "TIMEOUT" | "MEMKILL" | "CANCELLED")
        }

        fn job_stopped(&self, status: &str) -> bool {
            status == "COMPLETED" || self.job_failed(status)
        }

        fn job_memkill(&self, status: &str, _job_id: &str, _mem_mb: u64) -> bool {
            status == "MEMKILL"
        }

        fn job_timeout(&self, status: &str, _job_id: &str, _time_minutes: u64) -> bool {
            status == "TIMEOUT"
        }
    }

    fn unit() -> WorkUnit {
        WorkUnit {
            task_no: 5,
            name: "touch".into(),
            actions: vec![WireAction::Shell {
                command: "true".into(),
            }],
            targets: vec![],
            kwargs: Default::default(),
        }
    }

    fn quiet() -> impl Fn(usize, &str, &str) + Send + Sync {
        |_, _, _| {}
    }

    #[tokio::test]
    async fn memkill_retries_scale_memory_until_success() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = Utf8PathBuf::from(dir.path().to_str().unwrap());
        let fake = Arc::new(FakeQueue::new(vec!["MEMKILL", "MEMKILL", "COMPLETED"]));
        let queue: Arc<dyn GridQueue> = fake.clone();
        let monitor = GridMonitor::new(queue.clone());

        let result = execute_on_grid(
            &queue,
            &monitor,
            &unit(),
            &GridResources::new(60, 100, 1),
            &tmp,
            &quiet(),
        )
        .await;

        assert!(result.is_success(), "{}", result.error);
        assert_eq!(*fake.submitted_mem.lock().unwrap(), vec![100, 130, 169]);
    }

    #[tokio::test]
    async fn timeout_retries_stretch_the_time_budget() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = Utf8PathBuf::from(dir.path().to_str().unwrap());
        let fake = Arc::new(FakeQueue::new(vec!["TIMEOUT", "COMPLETED"]));
        let queue: Arc<dyn GridQueue> = fake.clone();
        let monitor = GridMonitor::new(queue.clone());

        let result = execute_on_grid(
            &queue,
            &monitor,
            &unit(),
            &GridResources::new(60, 100, 1),
            &tmp,
            &quiet(),
        )
        .await;

        assert!(result.is_success(), "{}", result.error);
        assert_eq!(*fake.submitted_time.lock().unwrap(), vec![60, 90]);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = Utf8PathBuf::from(dir.path().to_str().unwrap());
        let fake = Arc::new(FakeQueue::new(vec!["MEMKILL", "MEMKILL", "MEMKILL"]));
        let queue: Arc<dyn GridQueue> = fake.clone();
        let monitor = GridMonitor::new(queue.clone());

        let resources = GridResources::new(60, 100, 1).with_max_retries(2);
        let result = execute_on_grid(&queue, &monitor, &unit(), &resources, &tmp, &quiet()).await;

        assert!(!result.is_success());
        assert!(result.error.contains("MEMKILL"), "{}", result.error);
        assert_eq!(fake.submitted_mem.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn submission_failure_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = Utf8PathBuf::from(dir.path().to_str().unwrap());
        let mut fake = FakeQueue::new(vec!["COMPLETED"]);
        fake.fail_submission = true;
        let queue: Arc<dyn GridQueue> = Arc::new(fake);
        let monitor = GridMonitor::new(queue.clone());

        let result = execute_on_grid(
            &queue,
            &monitor,
            &unit(),
            &GridResources::new(60, 100, 1),
            &tmp,
            &quiet(),
        )
        .await;

        assert!(!result.is_success());
        assert!(result.error.contains("submission failed"));
    }
}
