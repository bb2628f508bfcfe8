//! The task model: a unit of work with tracked inputs, tracked outputs,
//! and an ordered list of actions.

use std::{collections::BTreeMap, fmt, sync::Arc};

use anadama_tracked::{Fingerprint, Tracked};
use anadama_grid::WorkResult;

pub type TaskNo = usize;

type ActionFn = dyn Fn(&Task) -> Result<(), String> + Send + Sync;

/// One step of a task. Shell commands run under the operating-system
/// shell; function actions run in-process. Functions registered by name
/// can additionally travel to grid nodes through the work-unit
/// transport.
#[derive(Clone)]
pub enum Action {
    Shell(String),
    Func {
        name: String,
        func: Arc<ActionFn>,
    },
    Named {
        name: String,
        args: serde_json::Value,
    },
}

impl Action {
    pub fn sh(command: impl Into<String>) -> Self {
        Action::Shell(command.into())
    }

    pub fn func<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Task) -> Result<(), String> + Send + Sync + 'static,
    {
        Action::Func {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    pub fn named(name: impl Into<String>, args: serde_json::Value) -> Self {
        Action::Named {
            name: name.into(),
            args,
        }
    }

    /// The program name shown in task descriptions.
    pub(crate) fn describe(&self) -> String {
        match self {
            Action::Shell(command) => command
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_owned(),
            Action::Func { name, .. } | Action::Named { name, .. } => name.clone(),
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Shell(command) => f.debug_tuple("Shell").field(command).finish(),
            Action::Func { name, .. } => f.debug_struct("Func").field("name", name).finish(),
            Action::Named { name, args } => f
                .debug_struct("Named")
                .field("name", name)
                .field("args", args)
                .finish(),
        }
    }
}

/// A task dependency: either a tracked artifact or another task, where
/// the task form denotes a graph edge rather than an artifact.
#[derive(Debug, Clone)]
pub enum Dependency {
    Tracked(Arc<Tracked>),
    Task(TaskNo),
}

impl Dependency {
    pub fn as_tracked(&self) -> Option<&Arc<Tracked>> {
        match self {
            Dependency::Tracked(tracked) => Some(tracked),
            Dependency::Task(_) => None,
        }
    }
}

/// A unit of work. Immutable once registered; the workflow hands out
/// `Arc<Task>` handles.
#[derive(Debug)]
pub struct Task {
    pub task_no: TaskNo,
    pub name: String,
    /// Short label for UIs, derived from the first action when no name
    /// was given.
    pub description: String,
    pub depends: Vec<Dependency>,
    pub targets: Vec<Arc<Tracked>>,
    pub actions: Vec<Action>,
    pub visible: bool,
    /// Formatting values available to `[key]` placeholders in shell
    /// actions, carried along for grid transport.
    pub kwargs: BTreeMap<String, String>,
}

impl Task {
    /// The tracked dependencies, task markers excluded.
    pub fn tracked_depends(&self) -> impl Iterator<Item = &Arc<Tracked>> {
        self.depends.iter().filter_map(Dependency::as_tracked)
    }
}

/// The outcome of running (or synthesising) one task.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_no: TaskNo,
    /// Empty on success.
    pub error: String,
    /// Target keys to persist in the fingerprint store.
    pub dep_keys: Vec<String>,
    pub dep_compares: Vec<Vec<Fingerprint>>,
}

impl TaskResult {
    pub fn success(
        task_no: TaskNo,
        dep_keys: Vec<String>,
        dep_compares: Vec<Vec<Fingerprint>>,
    ) -> Self {
        Self {
            task_no,
            error: String::new(),
            dep_keys,
            dep_compares,
        }
    }

    pub fn failed(task_no: TaskNo, error: impl Into<String>) -> Self {
        Self {
            task_no,
            error: error.into(),
            dep_keys: Vec::new(),
            dep_compares: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_empty()
    }
}

impl From<WorkResult> for TaskResult {
    fn from(result: WorkResult) -> Self {
        Self {
            task_no: result.task_no,
            error: result.error,
            dep_keys: result.dep_keys,
            dep_compares: result.dep_compares,
        }
    }
}
