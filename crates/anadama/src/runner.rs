//! The runner: walks the task graph in dependency order and dispatches
//! runnable tasks to the local and grid worker pools.
//!
//! One coordinator loop owns the fingerprint store and the run state;
//! workers only ever touch the work and result channels. For every task
//! the ordering is: fingerprints persisted, completion event emitted,
//! then the graph walker is told the node finished, so a child can
//! never be submitted before its parent's fingerprints are durable.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use camino::Utf8PathBuf;
use petgraph::{graph::NodeIndex, Direction, Graph};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, warn};

use anadama_backend::Backend;
use anadama_graph_utils::{Walker, Walking};
use anadama_grid::{
    execute_on_grid, FunctionRegistry, GridMonitor, GridQueue, GridResources, WireAction, WorkUnit,
};
use anadama_tracked::DependencyIndex;

use crate::{
    container::TaskContainer,
    reporters::Reporter,
    task::{Action, Task, TaskNo, TaskResult},
    workflow::WorkflowError,
};

pub(crate) struct ExecutionRequest<'w> {
    pub dag: &'w Graph<TaskNo, ()>,
    pub tasks: &'w TaskContainer,
    pub depidx: &'w DependencyIndex,
    /// Tasks to execute.
    pub candidates: HashSet<TaskNo>,
    /// Tasks already satisfied by the skip pass.
    pub skipped: HashSet<TaskNo>,
    /// Tasks wanted by an explicit selection but cut off by an
    /// exclusion; they fail synthetically instead of running.
    pub unrunnable: HashSet<TaskNo>,
    pub routes: HashMap<TaskNo, GridResources>,
    pub registry: Arc<FunctionRegistry>,
    pub jobs: usize,
    pub grid_jobs: usize,
    pub grid: Option<Arc<dyn GridQueue>>,
    pub grid_tmpdir: Utf8PathBuf,
    pub quit_early: bool,
    pub reporter: Arc<dyn Reporter>,
}

pub(crate) struct ExecutionOutcome {
    pub completed: Vec<TaskNo>,
    pub failed: Vec<(String, TaskResult)>,
}

#[derive(Default)]
struct RunState {
    done: HashSet<TaskNo>,
    failed: HashSet<TaskNo>,
}

type RunningWalker = Walker<NodeIndex, Walking>;

enum Outcome {
    Executed {
        task: Arc<Task>,
        result: TaskResult,
        done: oneshot::Sender<()>,
    },
    Skipped {
        task_no: TaskNo,
        done: oneshot::Sender<()>,
    },
    Synthetic {
        task: Arc<Task>,
        reason: String,
        done: oneshot::Sender<()>,
    },
    Dropped {
        done: oneshot::Sender<()>,
    },
}

pub(crate) async fn execute(
    backend: &Backend,
    req: ExecutionRequest<'_>,
) -> Result<ExecutionOutcome, WorkflowError> {
    let ExecutionRequest {
        dag,
        tasks,
        depidx,
        candidates,
        skipped,
        unrunnable,
        routes,
        registry,
        jobs,
        grid_jobs,
        grid,
        grid_tmpdir,
        quit_early,
        reporter,
    } = req;

    let state = Arc::new(Mutex::new(RunState {
        done: skipped.iter().copied().collect(),
        failed: HashSet::new(),
    }));

    let (walker, mut nodes) = Walker::new(dag).walk();
    let walker: Arc<Mutex<RunningWalker>> = Arc::new(Mutex::new(walker));

    let (result_tx, mut result_rx) = mpsc::unbounded_channel::<Outcome>();
    let local_pool = Arc::new(Semaphore::new(jobs));
    let grid_pool = Arc::new(Semaphore::new(grid_jobs));
    let monitor = grid
        .as_ref()
        .map(|queue| Arc::new(GridMonitor::new(queue.clone())));

    // The dispatcher consumes walker emissions: it either resolves a
    // node on the spot (skipped, dropped, parent-failed) or spawns a
    // worker job carrying the walker's done callback.
    let dispatcher = {
        let state = state.clone();
        let result_tx = result_tx.clone();
        let reporter = reporter.clone();
        async move {
            while let Some((node, done)) = nodes.recv().await {
                let task_no = dag[node];
                let decision = classify(
                    dag, tasks, &candidates, &skipped, &unrunnable, quit_early, &state, node,
                    task_no,
                );
                match decision {
                    Classified::Skip => {
                        let _ = result_tx.send(Outcome::Skipped { task_no, done });
                    }
                    Classified::Drop => {
                        let _ = result_tx.send(Outcome::Dropped { done });
                    }
                    Classified::ParentFailed(task) => {
                        let _ = result_tx.send(Outcome::Synthetic {
                            task,
                            reason: "parent task failed".to_owned(),
                            done,
                        });
                    }
                    Classified::Run(task) => {
                        reporter.task_started(&task);
                        let route = match (routes.get(&task_no), &grid) {
                            (Some(resources), Some(queue)) => Some((
                                resources.clone(),
                                queue.clone(),
                                monitor.clone().expect("monitor exists with grid"),
                            )),
                            _ => None,
                        };
                        let pool = if route.is_some() {
                            grid_pool.clone()
                        } else {
                            local_pool.clone()
                        };
                        let registry = registry.clone();
                        let reporter = reporter.clone();
                        let grid_tmpdir = grid_tmpdir.clone();
                        let job_tx = result_tx.clone();
                        let job_state = state.clone();
                        tokio::spawn(async move {
                            let _permit = pool
                                .acquire_owned()
                                .await
                                .expect("worker pool semaphore closed");
                            // A failure may have landed while this job
                            // waited for a worker slot.
                            if quit_early
                                && !job_state
                                    .lock()
                                    .expect("run state poisoned")
                                    .failed
                                    .is_empty()
                            {
                                let _ = job_tx.send(Outcome::Dropped { done });
                                return;
                            }
                            reporter.task_running(&task);
                            let result = match route {
                                Some((resources, queue, monitor)) => {
                                    run_grid_task(
                                        &task,
                                        &resources,
                                        &queue,
                                        &monitor,
                                        &grid_tmpdir,
                                        reporter.as_ref(),
                                    )
                                    .await
                                }
                                None => run_local_task(task.clone(), registry).await,
                            };
                            let _ = job_tx.send(Outcome::Executed { task, result, done });
                        });
                    }
                }
            }
        }
    };
    drop(result_tx);

    // The coordinator: the only writer of the fingerprint store.
    let coordinator = async {
        let mut completed = Vec::new();
        let mut failures: Vec<(String, TaskResult)> = Vec::new();
        let mut fatal: Option<WorkflowError> = None;

        while let Some(outcome) = result_rx.recv().await {
            match outcome {
                Outcome::Skipped { task_no, done } => {
                    state.lock().expect("run state poisoned").done.insert(task_no);
                    let _ = done.send(());
                }
                Outcome::Dropped { done } => {
                    let _ = done.send(());
                }
                Outcome::Synthetic { task, reason, done } => {
                    let result = TaskResult::failed(task.task_no, reason);
                    state
                        .lock()
                        .expect("run state poisoned")
                        .failed
                        .insert(task.task_no);
                    reporter.task_failed(&task, &result);
                    failures.push((task.name.clone(), result));
                    if quit_early {
                        cancel(&walker);
                    }
                    let _ = done.send(());
                }
                Outcome::Executed { task, result, done } => {
                    if result.is_success() && fatal.is_none() {
                        match persist(backend, &task, &result, depidx) {
                            Ok(()) => {
                                state
                                    .lock()
                                    .expect("run state poisoned")
                                    .done
                                    .insert(task.task_no);
                                completed.push(task.task_no);
                                reporter.task_completed(&task, &result);
                            }
                            Err(e) => {
                                // A broken store invalidates every later
                                // skip decision: stop the run.
                                warn!(error = %e, "fingerprint store write failed, aborting run");
                                fatal = Some(e.into());
                                cancel(&walker);
                            }
                        }
                    } else if result.is_success() {
                        // Store already failed; drain without recording.
                    } else {
                        state
                            .lock()
                            .expect("run state poisoned")
                            .failed
                            .insert(task.task_no);
                        reporter.task_failed(&task, &result);
                        failures.push((task.name.clone(), result));
                        if quit_early {
                            cancel(&walker);
                        }
                    }
                    let _ = done.send(());
                }
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(ExecutionOutcome {
                completed,
                failed: failures,
            }),
        }
    };

    let ((), outcome) = tokio::join!(dispatcher, coordinator);
    outcome
}

enum Classified {
    Skip,
    Drop,
    ParentFailed(Arc<Task>),
    Run(Arc<Task>),
}

#[allow(clippy::too_many_arguments)]
fn classify(
    dag: &Graph<TaskNo, ()>,
    tasks: &TaskContainer,
    candidates: &HashSet<TaskNo>,
    skipped: &HashSet<TaskNo>,
    unrunnable: &HashSet<TaskNo>,
    quit_early: bool,
    state: &Arc<Mutex<RunState>>,
    node: NodeIndex,
    task_no: TaskNo,
) -> Classified {
    if skipped.contains(&task_no) {
        return Classified::Skip;
    }
    let task = match tasks.get(task_no) {
        Some(task) => task.clone(),
        None => return Classified::Drop,
    };
    let state = state.lock().expect("run state poisoned");
    if candidates.contains(&task_no) {
        let parents_done = dag
            .neighbors_directed(node, Direction::Incoming)
            .all(|p| state.done.contains(&dag[p]));
        if !parents_done {
            return Classified::ParentFailed(task);
        }
        if quit_early && !state.failed.is_empty() {
            // quit-early: stop submitting; in-flight tasks finish out.
            return Classified::Drop;
        }
        Classified::Run(task)
    } else if unrunnable.contains(&task_no) {
        Classified::ParentFailed(task)
    } else {
        Classified::Drop
    }
}

fn cancel(walker: &Arc<Mutex<RunningWalker>>) {
    if walker
        .lock()
        .expect("walker mutex poisoned")
        .cancel()
        .is_err()
    {
        debug!("unable to cancel graph walk");
    }
}

/// Write the task's target fingerprints, then the current fingerprints
/// of any dependency no task produces, so later runs notice when such
/// inputs change.
fn persist(
    backend: &Backend,
    task: &Task,
    result: &TaskResult,
    depidx: &DependencyIndex,
) -> Result<(), anadama_backend::BackendError> {
    backend.save(&result.dep_keys, &result.dep_compares)?;

    let mut keys = Vec::new();
    let mut values = Vec::new();
    for dep in task.tracked_depends() {
        if depidx.contains(dep) {
            continue;
        }
        match dep.compare().collect::<Result<Vec<_>, _>>() {
            Ok(atoms) => {
                keys.push(dep.name().to_owned());
                values.push(atoms);
            }
            Err(e) => {
                warn!(dep = dep.name(), error = %e, "unable to fingerprint loose dependency");
            }
        }
    }
    backend.save(&keys, &values)
}

/// Execute a task's actions in this process, then collect per-target
/// fingerprints. Shell actions run under the OS shell; function actions
/// run on the blocking pool.
async fn run_local_task(task: Arc<Task>, registry: Arc<FunctionRegistry>) -> TaskResult {
    for (i, action) in task.actions.iter().enumerate() {
        let failure = match action {
            Action::Shell(command) => match anadama_process::run_shell(command).await {
                Ok(output) if output.success() => None,
                Ok(output) => Some(format!(
                    "command exited with {:?}\nstdout:\n{}\nstderr:\n{}",
                    output.exit, output.stdout, output.stderr
                )),
                Err(e) => Some(e.to_string()),
            },
            Action::Func { func, .. } => {
                let func = func.clone();
                let task = task.clone();
                match tokio::task::spawn_blocking(move || func(&task)).await {
                    Ok(Ok(())) => None,
                    Ok(Err(message)) => Some(message),
                    Err(e) => Some(format!("action panicked: {e}")),
                }
            }
            Action::Named { name, args } => match registry.get(name) {
                Some(func) => {
                    let func = func.clone();
                    let args = args.clone();
                    match tokio::task::spawn_blocking(move || func(&args)).await {
                        Ok(Ok(())) => None,
                        Ok(Err(message)) => Some(message),
                        Err(e) => Some(format!("action panicked: {e}")),
                    }
                }
                None => Some(format!("no function registered under `{name}`")),
            },
        };
        if let Some(message) = failure {
            return TaskResult::failed(
                task.task_no,
                format!("Error executing action {i}. {message}"),
            );
        }
    }

    let collect_task = task.clone();
    tokio::task::spawn_blocking(move || collect_target_fingerprints(&collect_task))
        .await
        .unwrap_or_else(|e| TaskResult::failed(task.task_no, format!("collector panicked: {e}")))
}

fn collect_target_fingerprints(task: &Task) -> TaskResult {
    let mut dep_keys = Vec::with_capacity(task.targets.len());
    let mut dep_compares = Vec::with_capacity(task.targets.len());
    for target in &task.targets {
        match target.compare().collect::<Result<Vec<_>, _>>() {
            Ok(atoms) => {
                dep_keys.push(target.name().to_owned());
                dep_compares.push(atoms);
            }
            Err(e) => {
                return TaskResult::failed(
                    task.task_no,
                    format!("Failed to produce target `{}': {e}", target.name()),
                );
            }
        }
    }
    TaskResult::success(task.task_no, dep_keys, dep_compares)
}

/// Ship a task through the grid state machine.
async fn run_grid_task(
    task: &Arc<Task>,
    resources: &GridResources,
    queue: &Arc<dyn GridQueue>,
    monitor: &Arc<GridMonitor>,
    tmpdir: &Utf8PathBuf,
    reporter: &dyn Reporter,
) -> TaskResult {
    let unit = match to_work_unit(task) {
        Ok(unit) => unit,
        Err(message) => return TaskResult::failed(task.task_no, message),
    };
    let on_status = |task_no: usize, job_id: &str, message: &str| {
        reporter.task_grid_status(task_no, job_id, message);
    };
    execute_on_grid(queue, monitor, &unit, resources, tmpdir, &on_status)
        .await
        .into()
}

fn to_work_unit(task: &Task) -> Result<WorkUnit, String> {
    let mut actions = Vec::with_capacity(task.actions.len());
    for action in &task.actions {
        actions.push(match action {
            Action::Shell(command) => WireAction::Shell {
                command: command.clone(),
            },
            Action::Named { name, args } => WireAction::Named {
                name: name.clone(),
                args: args.clone(),
            },
            Action::Func { name, .. } => {
                return Err(format!(
                    "action `{name}` is an in-process closure and cannot run on a grid; \
                     register it by name instead"
                ))
            }
        });
    }
    let mut targets = Vec::with_capacity(task.targets.len());
    for target in &task.targets {
        match target.to_spec() {
            Some(spec) => targets.push(spec),
            None => {
                return Err(format!(
                    "target `{}` cannot be rebuilt on a grid node",
                    target.name()
                ))
            }
        }
    }
    Ok(WorkUnit {
        task_no: task.task_no,
        name: task.name.clone(),
        actions,
        targets,
        kwargs: task.kwargs.clone(),
    })
}
