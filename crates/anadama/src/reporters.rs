//! The reporter interface.
//!
//! The engine emits lifecycle events on this trait; rendering lives
//! outside the core. [`TracingReporter`] forwards everything to the
//! `tracing` log stream and is the default sink; [`ReporterGroup`] fans
//! events out to several reporters.

use std::sync::Arc;

use tracing::{error, info};

use crate::{
    task::{Task, TaskNo, TaskResult},
    workflow::RunSummary,
};

pub trait Reporter: Send + Sync {
    /// The run is starting; `total_tasks` counts every registered task.
    fn started(&self, total_tasks: usize) {
        let _ = total_tasks;
    }

    /// The task was found up to date and will not run.
    fn task_skipped(&self, task: &Task) {
        let _ = task;
    }

    /// The task was handed to a worker.
    fn task_started(&self, task: &Task) {
        let _ = task;
    }

    /// The task's first action is executing.
    fn task_running(&self, task: &Task) {
        let _ = task;
    }

    /// Announced once per task in a dry run instead of execution.
    fn task_command(&self, task: &Task) {
        let _ = task;
    }

    fn task_failed(&self, task: &Task, result: &TaskResult) {
        let _ = (task, result);
    }

    fn task_completed(&self, task: &Task, result: &TaskResult) {
        let _ = (task, result);
    }

    /// Grid backends report queue transitions and final resource usage.
    fn task_grid_status(&self, task_no: TaskNo, job_id: &str, message: &str) {
        let _ = (task_no, job_id, message);
    }

    fn finished(&self, summary: &RunSummary) {
        let _ = summary;
    }
}

/// Routes events into the `tracing` stream. Invisible tasks are logged
/// at debug level only.
#[derive(Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn started(&self, total_tasks: usize) {
        info!(total_tasks, "run started");
    }

    fn task_skipped(&self, task: &Task) {
        if task.visible {
            info!(task_no = task.task_no, name = %task.name, "skipped");
        } else {
            tracing::debug!(task_no = task.task_no, name = %task.name, "skipped");
        }
    }

    fn task_started(&self, task: &Task) {
        if task.visible {
            info!(task_no = task.task_no, name = %task.name, "started");
        }
    }

    fn task_running(&self, task: &Task) {
        tracing::debug!(task_no = task.task_no, name = %task.name, "running");
    }

    fn task_command(&self, task: &Task) {
        for action in &task.actions {
            info!(task_no = task.task_no, action = ?action, "dry run");
        }
    }

    fn task_failed(&self, task: &Task, result: &TaskResult) {
        error!(task_no = task.task_no, name = %task.name, error = %result.error, "failed");
    }

    fn task_completed(&self, task: &Task, result: &TaskResult) {
        if task.visible {
            info!(task_no = task.task_no, name = %task.name, targets = result.dep_keys.len(), "completed");
        }
    }

    fn task_grid_status(&self, task_no: TaskNo, job_id: &str, message: &str) {
        info!(task_no, job_id, message, "grid status");
    }

    fn finished(&self, summary: &RunSummary) {
        info!(
            completed = summary.completed.len(),
            skipped = summary.skipped.len(),
            failed = summary.failed.len(),
            "run finished"
        );
    }
}

/// Fans every event out to a list of reporters, in order.
#[derive(Default)]
pub struct ReporterGroup {
    reporters: Vec<Arc<dyn Reporter>>,
}

impl ReporterGroup {
    pub fn new(reporters: Vec<Arc<dyn Reporter>>) -> Self {
        Self { reporters }
    }

    pub fn push(&mut self, reporter: Arc<dyn Reporter>) {
        self.reporters.push(reporter);
    }
}

impl Reporter for ReporterGroup {
    fn started(&self, total_tasks: usize) {
        for r in &self.reporters {
            r.started(total_tasks);
        }
    }

    fn task_skipped(&self, task: &Task) {
        for r in &self.reporters {
            r.task_skipped(task);
        }
    }

    fn task_started(&self, task: &Task) {
        for r in &self.reporters {
            r.task_started(task);
        }
    }

    fn task_running(&self, task: &Task) {
        for r in &self.reporters {
            r.task_running(task);
        }
    }

    fn task_command(&self, task: &Task) {
        for r in &self.reporters {
            r.task_command(task);
        }
    }

    fn task_failed(&self, task: &Task, result: &TaskResult) {
        for r in &self.reporters {
            r.task_failed(task, result);
        }
    }

    fn task_completed(&self, task: &Task, result: &TaskResult) {
        for r in &self.reporters {
            r.task_completed(task, result);
        }
    }

    fn task_grid_status(&self, task_no: TaskNo, job_id: &str, message: &str) {
        for r in &self.reporters {
            r.task_grid_status(task_no, job_id, message);
        }
    }

    fn finished(&self, summary: &RunSummary) {
        for r in &self.reporters {
            r.finished(summary);
        }
    }
}
