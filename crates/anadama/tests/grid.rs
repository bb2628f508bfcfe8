//! Routing tasks through a grid backend, driven end-to-end with a
//! scripted queue standing in for the scheduler.

use std::{fs, sync::Arc, sync::Mutex, time::Duration};

use async_trait::async_trait;
use camino::Utf8PathBuf;
use pretty_assertions::assert_eq;

use anadama::{GoOptions, GridResources, Workflow};
use anadama_grid::{
    transport, FunctionRegistry, GridError, GridQueue, GridScript, QueueStatus, ScriptRequest,
};

/// Accepts every submission and "runs" the job by executing its
/// work-unit invocation in-process.
#[derive(Default)]
struct InstantQueue {
    jobs: Mutex<Vec<String>>,
    submissions: Mutex<usize>,
}

#[async_trait]
impl GridQueue for InstantQueue {
    fn name(&self) -> &str {
        "instant"
    }

    fn refresh_rate(&self) -> Duration {
        Duration::from_millis(5)
    }

    async fn create_grid_script(&self, request: &ScriptRequest) -> Result<GridScript, GridError> {
        let base = request.tmpdir.join(format!(
            "instant_{}_{}",
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
        *self.submissions.lock().unwrap() += 1;
        let unit = Utf8PathBuf::from(&script.submit_args[script.submit_args.len() - 2]);
        let result = Utf8PathBuf::from(&script.submit_args[script.submit_args.len() - 1]);
        transport::run_work_unit_files(&unit, &result, &FunctionRegistry::new())
            .map_err(|e| GridError::Submit(e.to_string()))?;
        let job_id = format!("ij{}", self.jobs.lock().unwrap().len());
        self.jobs.lock().unwrap().push(job_id.clone());
        Ok(job_id)
    }

    async fn refresh_queue_status(&self) -> Result<Vec<QueueStatus>, GridError> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .map(|id| QueueStatus::new(id.clone(), "COMPLETED"))
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

fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from(dir.path().to_str().unwrap());
    (dir, root)
}

fn build(root: &Utf8PathBuf, routed: bool) -> Workflow {
    let out = root.join("grid_out.txt");
    let mut wf = Workflow::new();
    let mut builder = wf
        .task()
        .sh(format!("echo computed > {out}"))
        .target(out.as_str())
        .name("grid_task");
    if routed {
        builder = builder.grid(GridResources::new(30, 256, 1));
    }
    builder.register().unwrap();
    wf
}

#[test]
fn routed_tasks_run_through_the_queue_and_skip_next_time() {
    let (_dir, root) = scratch();
    let queue = Arc::new(InstantQueue::default());

    let opts = |queue: &Arc<InstantQueue>| GoOptions {
        backend_dir: Some(root.join("db")),
        grid: Some(queue.clone() as Arc<dyn GridQueue>),
        grid_tmpdir: Some(root.join("grid_files")),
        ..GoOptions::default()
    };

    let summary = build(&root, true).go(opts(&queue)).unwrap();
    assert_eq!(summary.completed.len(), 1);
    assert_eq!(*queue.submissions.lock().unwrap(), 1);
    assert_eq!(
        fs::read_to_string(root.join("grid_out.txt")).unwrap(),
        "computed\n"
    );

    // The grid result's fingerprints were persisted: next run skips and
    // submits nothing.
    let queue2 = Arc::new(InstantQueue::default());
    let summary = build(&root, true).go(opts(&queue2)).unwrap();
    assert_eq!(summary.skipped.len(), 1);
    assert_eq!(*queue2.submissions.lock().unwrap(), 0);
}

#[test]
fn routed_tasks_fall_back_to_local_without_a_grid() {
    let (_dir, root) = scratch();
    let summary = build(&root, true)
        .go(GoOptions {
            backend_dir: Some(root.join("db")),
            ..GoOptions::default()
        })
        .unwrap();
    assert_eq!(summary.completed.len(), 1);
    assert!(root.join("grid_out.txt").as_std_path().exists());
}
