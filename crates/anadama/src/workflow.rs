//! The workflow facade: task registration, dependency validation,
//! selection filters, the skip pass, and the entry point that hands the
//! runnable set to the runner.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use camino::Utf8PathBuf;
use petgraph::{graph::NodeIndex, Direction, Graph};
use thiserror::Error;
use tracing::{debug, warn};

use anadama_backend::{Backend, BackendError};
use anadama_graph_utils::transitive_closure;
use anadama_grid::{FunctionRegistry, GridQueue, GridResources};
use anadama_tracked::{
    any_different, matcher, DependencyIndex, Tracked, TrackedInterner,
};

use crate::{
    container::TaskContainer,
    helpers::format_command,
    pattern,
    reporters::{Reporter, TracingReporter},
    runner::{self, ExecutionRequest},
    task::{Action, Dependency, Task, TaskNo, TaskResult},
};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("unable to find dependency `{key}` of type `{variant}`.{hint}")]
    NoSuchDependency {
        key: String,
        variant: &'static str,
        hint: String,
    },
    #[error("a task cannot be used as a target")]
    TargetIsTask,
    #[error(
        "unable to replace all keys in command. Original command: `{original}` Final formatted \
         command: `{formatted}`"
    )]
    UnresolvedPlaceholder { original: String, formatted: String },
    #[error("`{key}` is already the target of task {task_no}")]
    DuplicateTarget { key: String, task_no: TaskNo },
    #[error("unable to find task `{0}`")]
    NoSuchTask(String),
    #[error("unable to find target {0}")]
    NoSuchTarget(String),
    #[error("pattern {0} matched no targets")]
    PatternMatchedNothing(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("run failed: {} task(s) failed", .0.failed.len())]
    RunFailed(RunSummary),
}

/// Anything that can stand in a depends or targets list.
#[derive(Clone)]
pub enum Input {
    /// A raw path; coerced to a directory or huge-file artifact by the
    /// trailing-slash convention.
    Path(String),
    Tracked(Arc<Tracked>),
    /// A task marker: a graph edge, not an artifact.
    Task(TaskNo),
}

impl From<&str> for Input {
    fn from(value: &str) -> Self {
        Input::Path(value.to_owned())
    }
}

impl From<String> for Input {
    fn from(value: String) -> Self {
        Input::Path(value)
    }
}

impl From<&String> for Input {
    fn from(value: &String) -> Self {
        Input::Path(value.clone())
    }
}

impl From<Arc<Tracked>> for Input {
    fn from(value: Arc<Tracked>) -> Self {
        Input::Tracked(value)
    }
}

impl From<&Arc<Tracked>> for Input {
    fn from(value: &Arc<Tracked>) -> Self {
        Input::Tracked(value.clone())
    }
}

impl From<&Arc<Task>> for Input {
    fn from(value: &Arc<Task>) -> Self {
        Input::Task(value.task_no)
    }
}

/// Options for one invocation of [`Workflow::go`].
pub struct GoOptions {
    pub skip_nothing: bool,
    pub quit_early: bool,
    pub jobs: usize,
    pub grid_jobs: usize,
    pub until_task: Vec<String>,
    pub exclude_task: Vec<String>,
    pub target: Vec<String>,
    pub exclude_target: Vec<String>,
    pub dry_run: bool,
    /// Output directory; also the default home of the fingerprint store.
    pub output: Option<Utf8PathBuf>,
    /// Explicit fingerprint-store directory, overriding `output` and the
    /// environment discovery chain.
    pub backend_dir: Option<Utf8PathBuf>,
    pub grid: Option<Arc<dyn GridQueue>>,
    /// Where grid scripts and work-unit blobs are written; must be
    /// readable by every node of the cluster.
    pub grid_tmpdir: Option<Utf8PathBuf>,
    pub reporter: Option<Arc<dyn Reporter>>,
}

impl Default for GoOptions {
    fn default() -> Self {
        Self {
            skip_nothing: false,
            quit_early: false,
            jobs: 1,
            grid_jobs: 1,
            until_task: Vec::new(),
            exclude_task: Vec::new(),
            target: Vec::new(),
            exclude_target: Vec::new(),
            dry_run: false,
            output: None,
            backend_dir: None,
            grid: None,
            grid_tmpdir: None,
            reporter: None,
        }
    }
}

/// What one `go()` did.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub completed: Vec<TaskNo>,
    pub skipped: Vec<TaskNo>,
    /// `(task name, result)` in order of observation.
    pub failed: Vec<(String, TaskResult)>,
    /// Tasks a dry run would have executed, in execution order.
    pub planned: Vec<TaskNo>,
}

impl RunSummary {
    pub fn succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Workflow {
    interner: TrackedInterner,
    depidx: DependencyIndex,
    dag: Graph<TaskNo, ()>,
    node_of: Vec<NodeIndex>,
    tasks: TaskContainer,
    strict: bool,
    registry: Arc<FunctionRegistry>,
    routes: HashMap<TaskNo, GridResources>,
}

impl Default for Workflow {
    fn default() -> Self {
        Self::new()
    }
}

impl Workflow {
    pub fn new() -> Self {
        Self {
            interner: TrackedInterner::new(),
            depidx: DependencyIndex::new(),
            dag: Graph::new(),
            node_of: Vec::new(),
            tasks: TaskContainer::new(),
            strict: false,
            registry: Arc::new(FunctionRegistry::new()),
            routes: HashMap::new(),
        }
    }

    /// In strict mode a dependency that is not the target of another
    /// task must be declared with [`Workflow::already_exists`]; existing
    /// files are not auto-promoted.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn interner(&self) -> &TrackedInterner {
        &self.interner
    }

    /// Register named functions usable as grid-safe actions.
    pub fn registry_mut(&mut self) -> &mut FunctionRegistry {
        Arc::make_mut(&mut self.registry)
    }

    /// If this process was launched as a remote work-unit runner,
    /// execute the unit and exit. Call after registering functions.
    pub fn intercept_worker(&self) {
        anadama_grid::maybe_run_work_unit(&self.registry);
    }

    pub fn tasks(&self) -> &TaskContainer {
        &self.tasks
    }

    /// Begin registering a task.
    pub fn task(&mut self) -> TaskBuilder<'_> {
        TaskBuilder {
            workflow: self,
            actions: Vec::new(),
            depends: Vec::new(),
            targets: Vec::new(),
            name: None,
            visible: true,
            interpret: true,
            kwargs: Default::default(),
            grid: None,
        }
    }

    /// Register one task per `(depends, targets)` pair, all sharing the
    /// same command template. Placeholders are expanded against each
    /// pair in turn.
    pub fn task_group<I>(
        &mut self,
        command: &str,
        pairs: I,
        name: Option<&str>,
    ) -> Result<Vec<Arc<Task>>, WorkflowError>
    where
        I: IntoIterator<Item = (Vec<Input>, Vec<Input>)>,
    {
        let mut group = Vec::new();
        for (depends, targets) in pairs {
            let mut builder = self.task().sh(command).depends(depends).targets(targets);
            if let Some(name) = name {
                builder = builder.name(name);
            }
            group.push(builder.register()?);
        }
        Ok(group)
    }

    /// Declare artifacts as pre-existing: a hidden no-op task becomes
    /// their producer so the rest of the engine treats them uniformly.
    pub fn already_exists<I, T>(&mut self, items: I) -> Result<Arc<Task>, WorkflowError>
    where
        I: IntoIterator<Item = T>,
        T: Into<Input>,
    {
        let mut targets = Vec::new();
        for item in items {
            match item.into() {
                Input::Path(raw) => targets.push(self.interner.auto(&raw)),
                Input::Tracked(tracked) => targets.push(tracked),
                Input::Task(_) => return Err(WorkflowError::TargetIsTask),
            }
        }
        Ok(self.register_preexisting(targets))
    }

    fn register_preexisting(&mut self, targets: Vec<Arc<Tracked>>) -> Arc<Task> {
        let task_no = self.tasks.len();
        let task = Arc::new(Task {
            task_no,
            name: "Track pre-existing dependencies".to_owned(),
            description: "Track pre-existing dependencies".to_owned(),
            depends: Vec::new(),
            targets,
            actions: Vec::new(),
            visible: false,
            kwargs: Default::default(),
        });
        let node = self.dag.add_node(task_no);
        self.node_of.push(node);
        self.tasks.push(task.clone());
        for target in &task.targets {
            self.depidx.link(target, Some(task_no));
        }
        debug!(task_no, "registered pre-existing dependencies");
        task
    }

    fn register(
        &mut self,
        actions: Vec<Action>,
        depends: Vec<Input>,
        targets: Vec<Input>,
        name: Option<String>,
        visible: bool,
        interpret: bool,
        kwargs: std::collections::BTreeMap<String, String>,
        grid: Option<GridResources>,
    ) -> Result<Arc<Task>, WorkflowError> {
        // Coerce inputs before touching any engine state so a failed
        // registration leaves nothing behind.
        let depends: Vec<Dependency> = depends
            .into_iter()
            .map(|input| match input {
                Input::Path(raw) => Dependency::Tracked(self.interner.auto(&raw)),
                Input::Tracked(tracked) => Dependency::Tracked(tracked),
                Input::Task(no) => Dependency::Task(no),
            })
            .collect();
        let mut targets_out = Vec::with_capacity(targets.len());
        for input in targets {
            match input {
                Input::Path(raw) => targets_out.push(self.interner.auto(&raw)),
                Input::Tracked(tracked) => targets_out.push(tracked),
                Input::Task(_) => return Err(WorkflowError::TargetIsTask),
            }
        }
        let targets = targets_out;

        for target in &targets {
            if let Ok(Some(task_no)) = self.depidx.task_for(target) {
                return Err(WorkflowError::DuplicateTarget {
                    key: target.name().to_owned(),
                    task_no,
                });
            }
        }

        // Format shell actions up front: a typo'd or out-of-range
        // placeholder fails the registration before any state changes.
        let mut formatted_actions = Vec::with_capacity(actions.len());
        for action in actions {
            formatted_actions.push(match action {
                Action::Shell(cmd) if interpret => {
                    Action::Shell(format_command(&cmd, &depends, &targets, &kwargs)?)
                }
                other => other,
            });
        }
        let actions = formatted_actions;

        // Resolve dependencies to producer edges without mutating, so
        // unknown dependencies fail the whole registration cleanly.
        let mut edges: HashSet<TaskNo> = HashSet::new();
        let mut promote: Vec<Arc<Tracked>> = Vec::new();
        for dep in &depends {
            match dep {
                Dependency::Task(no) => {
                    edges.insert(*no);
                }
                Dependency::Tracked(tracked) => {
                    if self.depidx.contains(tracked) {
                        if let Ok(Some(producer)) = self.depidx.task_for(tracked) {
                            edges.insert(producer);
                        }
                    } else if !tracked.must_preexist() {
                        // Variables, strings, and function results need
                        // no producer; their fingerprints are persisted
                        // with the consuming task.
                    } else if !self.strict && tracked.exists() {
                        promote.push(tracked.clone());
                    } else {
                        return Err(self.no_such_dep(tracked));
                    }
                }
            }
        }

        for tracked in promote {
            let noop = self.register_preexisting(vec![tracked]);
            edges.insert(noop.task_no);
        }

        let task_no = self.tasks.len();
        let derived = actions
            .first()
            .map(|a| a.describe())
            .unwrap_or_else(|| "noop".to_owned());
        let (name, description) = match name {
            Some(name) => (name.clone(), name),
            None => (format!("Task{task_no}"), derived),
        };

        let task = Arc::new(Task {
            task_no,
            name,
            description,
            depends,
            targets,
            actions,
            visible,
            kwargs,
        });

        let node = self.dag.add_node(task_no);
        self.node_of.push(node);
        for producer in edges {
            self.dag.add_edge(self.node_of[producer], node, ());
        }
        self.tasks.push(task.clone());
        for target in &task.targets {
            self.depidx.link(target, Some(task_no));
        }
        if let Some(resources) = grid {
            self.routes.insert(task_no, resources);
        }
        debug!(task_no, name = %task.name, "registered task");
        Ok(task)
    }

    fn no_such_dep(&self, dep: &Tracked) -> WorkflowError {
        let names: Vec<String> = self
            .tasks
            .iter()
            .flat_map(|task| {
                task.tracked_depends()
                    .map(|d| d.name().to_owned())
                    .chain(task.targets.iter().map(|t| t.name().to_owned()))
            })
            .collect();
        let hint = matcher::find_match(dep.name(), names.iter().map(String::as_str))
            .map(|closest| format!(" Perhaps you meant `{closest}'?"))
            .unwrap_or_default();
        WorkflowError::NoSuchDependency {
            key: dep.name().to_owned(),
            variant: dep.variant(),
            hint,
        }
    }

    fn task_match(&self, name_or_no: &str) -> Result<Vec<Arc<Task>>, WorkflowError> {
        let matched = self.tasks.find(name_or_no);
        if matched.is_empty() {
            return Err(WorkflowError::NoSuchTask(name_or_no.to_owned()));
        }
        Ok(matched)
    }

    fn closure(&self, starts: &[TaskNo], direction: Direction) -> HashSet<TaskNo> {
        let indices: Vec<NodeIndex> = starts.iter().map(|no| self.node_of[*no]).collect();
        transitive_closure(&self.dag, indices, direction)
            .into_iter()
            .copied()
            .collect()
    }

    /// Producers of targets matching `raw`, a literal key or an fnmatch
    /// pattern. Relative names are retried against the working
    /// directory, since target keys are absolute.
    fn target_match(&self, raw: &str) -> Result<HashSet<TaskNo>, WorkflowError> {
        if let Some(matched) = self.try_target_match(raw) {
            return Ok(matched);
        }
        if !raw.starts_with('/') {
            let retried = anadama_tracked::absolute(raw);
            if let Some(matched) = self.try_target_match(retried.as_str()) {
                return Ok(matched);
            }
        }
        if pattern::is_pattern(raw) {
            Err(WorkflowError::PatternMatchedNothing(raw.to_owned()))
        } else {
            Err(WorkflowError::NoSuchTarget(raw.to_owned()))
        }
    }

    fn try_target_match(&self, raw: &str) -> Option<HashSet<TaskNo>> {
        let matched: HashSet<TaskNo> = if pattern::is_pattern(raw) {
            let re = pattern::fnmatch_regex(raw).ok()?;
            self.tasks
                .all_targets()
                .filter(|(name, _)| re.is_match(name))
                .map(|(_, no)| no)
                .collect()
        } else {
            self.tasks
                .all_targets()
                .filter(|(name, _)| *name == raw)
                .map(|(_, no)| no)
                .collect()
        };
        (!matched.is_empty()).then_some(matched)
    }

    /// Run the workflow on a runtime of its own; the usual entry point
    /// for pipeline scripts.
    pub fn go(&mut self, opts: GoOptions) -> Result<RunSummary, WorkflowError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .expect("unable to start the runtime");
        runtime.block_on(self.go_async(opts))
    }

    /// Kick off execution of all previously configured tasks.
    pub async fn go_async(&mut self, opts: GoOptions) -> Result<RunSummary, WorkflowError> {
        let reporter: Arc<dyn Reporter> = opts
            .reporter
            .clone()
            .unwrap_or_else(|| Arc::new(TracingReporter));
        reporter.started(self.tasks.len());

        let backend = match &opts.backend_dir {
            Some(dir) => Backend::open(dir)?,
            None => Backend::default_for_output(opts.output.as_deref())?,
        };

        // Selection filters: explicit keeps from until/target, an
        // excluded subtree from exclude-task/exclude-target.
        let mut keep: HashSet<TaskNo> = HashSet::new();
        let mut keep_explicit = false;
        for sel in &opts.until_task {
            keep_explicit = true;
            for task in self.task_match(sel)? {
                keep.extend(self.closure(&[task.task_no], Direction::Incoming));
            }
        }
        for sel in &opts.target {
            keep_explicit = true;
            let producers: Vec<TaskNo> = self.target_match(sel)?.into_iter().collect();
            keep.extend(self.closure(&producers, Direction::Incoming));
        }

        let mut excluded_roots: HashSet<TaskNo> = HashSet::new();
        for sel in &opts.exclude_task {
            for task in self.task_match(sel)? {
                excluded_roots.insert(task.task_no);
            }
        }
        for sel in &opts.exclude_target {
            excluded_roots.extend(self.target_match(sel)?);
        }
        let excluded: HashSet<TaskNo> = if excluded_roots.is_empty() {
            HashSet::new()
        } else {
            let roots: Vec<TaskNo> = excluded_roots.iter().copied().collect();
            self.closure(&roots, Direction::Outgoing)
        };

        let base: HashSet<TaskNo> = if keep_explicit {
            keep
        } else {
            (0..self.tasks.len()).collect()
        };
        let mut candidates: HashSet<TaskNo> = base.difference(&excluded).copied().collect();

        // Descendants of an excluded task are silently dropped, except
        // when an explicit target/until selection wanted them: those
        // cannot be built and surface as parent failures.
        let unrunnable: HashSet<TaskNo> = if keep_explicit {
            base.intersection(&excluded)
                .filter(|no| !excluded_roots.contains(no))
                .copied()
                .collect()
        } else {
            HashSet::new()
        };

        // The skip pass: decide which candidates can be marked complete
        // without executing.
        let mut skipped: HashSet<TaskNo> = HashSet::new();
        if !opts.skip_nothing {
            let must_run = self.skip_pass(&candidates, &backend)?;
            skipped = candidates.difference(&must_run).copied().collect();
            let mut in_order: Vec<TaskNo> = skipped.iter().copied().collect();
            in_order.sort_unstable();
            for no in &in_order {
                if let Some(task) = self.tasks.get(*no) {
                    reporter.task_skipped(task);
                }
            }
            candidates = must_run;
        }

        if opts.dry_run {
            let mut planned: Vec<TaskNo> = Vec::new();
            for node in petgraph::algo::toposort(&self.dag, None)
                .expect("task graph is acyclic by construction")
            {
                let no = self.dag[node];
                if candidates.contains(&no) {
                    planned.push(no);
                    if let Some(task) = self.tasks.get(no) {
                        reporter.task_command(task);
                    }
                }
            }
            let summary = RunSummary {
                planned,
                skipped: sorted(skipped),
                ..Default::default()
            };
            reporter.finished(&summary);
            return Ok(summary);
        }

        let grid_tmpdir = opts.grid_tmpdir.clone().unwrap_or_else(|| {
            let base = opts
                .output
                .clone()
                .unwrap_or_else(|| Utf8PathBuf::from(std::env::temp_dir().to_string_lossy().into_owned()));
            match &opts.grid {
                Some(queue) => base.join(format!("{}_files", queue.name())),
                None => base.join("anadama_files"),
            }
        });

        let request = ExecutionRequest {
            dag: &self.dag,
            tasks: &self.tasks,
            depidx: &self.depidx,
            candidates,
            skipped: skipped.clone(),
            unrunnable,
            routes: self.routes.clone(),
            registry: self.registry.clone(),
            jobs: opts.jobs.max(1),
            grid_jobs: opts.grid_jobs.max(1),
            grid: opts.grid.clone(),
            grid_tmpdir,
            quit_early: opts.quit_early,
            reporter: reporter.clone(),
        };
        let outcome = runner::execute(&backend, request).await?;

        let summary = RunSummary {
            completed: sorted(outcome.completed),
            skipped: sorted(skipped),
            failed: outcome.failed,
            planned: Vec::new(),
        };
        reporter.finished(&summary);
        if summary.succeeded() {
            Ok(summary)
        } else {
            Err(WorkflowError::RunFailed(summary))
        }
    }

    /// Decide the subset of `candidates` that must run: tasks with
    /// neither depends nor targets always run, tasks whose artifacts
    /// differ from the store run, and must-run status propagates to
    /// every downstream candidate.
    fn skip_pass(
        &self,
        candidates: &HashSet<TaskNo>,
        backend: &Backend,
    ) -> Result<HashSet<TaskNo>, WorkflowError> {
        let mut should_run: HashSet<TaskNo> = HashSet::new();
        for &no in candidates {
            let task = self.tasks.get(no).expect("candidate task exists");
            if task.depends.is_empty() && task.targets.is_empty() {
                debug!(task_no = no, "must run: no targets or depends");
                should_run.insert(no);
            }
        }

        // Group by artifact so each one is compared exactly once, no
        // matter how many tasks reference it.
        let mut groups: HashMap<(&'static str, String), (Arc<Tracked>, Vec<TaskNo>)> =
            HashMap::new();
        for &no in candidates {
            if should_run.contains(&no) {
                continue;
            }
            let task = self.tasks.get(no).expect("candidate task exists");
            for tracked in task.tracked_depends().chain(task.targets.iter()) {
                groups
                    .entry((tracked.variant(), tracked.name().to_owned()))
                    .or_insert_with(|| (tracked.clone(), Vec::new()))
                    .1
                    .push(no);
            }
        }
        for (dep, nos) in groups.into_values() {
            if any_different(std::slice::from_ref(&dep), |key| backend.lookup(key))? {
                for no in nos {
                    debug!(task_no = no, dep = dep.name(), "must run: artifact changed");
                    should_run.insert(no);
                }
            }
        }

        // Propagate forward in topological order.
        for node in petgraph::algo::toposort(&self.dag, None)
            .expect("task graph is acyclic by construction")
        {
            let no = self.dag[node];
            if !candidates.contains(&no) || should_run.contains(&no) {
                continue;
            }
            let rerun_parent = self
                .dag
                .neighbors_directed(node, Direction::Incoming)
                .map(|p| self.dag[p])
                .find(|p| should_run.contains(p));
            if let Some(parent) = rerun_parent {
                debug!(task_no = no, parent, "must run: upstream task will rerun");
                should_run.insert(no);
            }
        }

        Ok(should_run)
    }
}

fn sorted(set: impl IntoIterator<Item = TaskNo>) -> Vec<TaskNo> {
    let mut v: Vec<TaskNo> = set.into_iter().collect();
    v.sort_unstable();
    v
}

/// Builder returned by [`Workflow::task`].
pub struct TaskBuilder<'w> {
    workflow: &'w mut Workflow,
    actions: Vec<Action>,
    depends: Vec<Input>,
    targets: Vec<Input>,
    name: Option<String>,
    visible: bool,
    interpret: bool,
    kwargs: std::collections::BTreeMap<String, String>,
    grid: Option<GridResources>,
}

impl TaskBuilder<'_> {
    /// Add a shell action. `[depends[N]]`, `[targets[N]]`, and `[key]`
    /// placeholders are expanded at registration.
    pub fn sh(mut self, command: impl Into<String>) -> Self {
        self.actions.push(Action::Shell(command.into()));
        self
    }

    pub fn action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn depend(mut self, input: impl Into<Input>) -> Self {
        self.depends.push(input.into());
        self
    }

    pub fn depends<I, T>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Input>,
    {
        self.depends.extend(inputs.into_iter().map(Into::into));
        self
    }

    /// Depend on the result of a function (database lookup, API call);
    /// the task reruns whenever the returned fingerprint changes.
    pub fn depend_fn<F>(mut self, key: impl Into<String>, func: F) -> Self
    where
        F: Fn() -> Result<anadama_tracked::Fingerprint, String> + Send + Sync + 'static,
    {
        let tracked = self.workflow.interner.function(key, func);
        self.depends.push(Input::Tracked(tracked));
        self
    }

    pub fn target(mut self, input: impl Into<Input>) -> Self {
        self.targets.push(input.into());
        self
    }

    pub fn targets<I, T>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Input>,
    {
        self.targets.extend(inputs.into_iter().map(Into::into));
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Keep the task out of reporters' default view.
    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    /// Leave shell actions untouched instead of expanding placeholders.
    pub fn raw_actions(mut self) -> Self {
        self.interpret = false;
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Route this task to the grid worker with the given resources.
    pub fn grid(mut self, resources: GridResources) -> Self {
        self.grid = Some(resources);
        self
    }

    pub fn register(self) -> Result<Arc<Task>, WorkflowError> {
        let TaskBuilder {
            workflow,
            actions,
            depends,
            targets,
            name,
            visible,
            interpret,
            kwargs,
            grid,
        } = self;
        if grid.is_some() {
            warn_if_unroutable(&actions);
        }
        workflow.register(
            actions, depends, targets, name, visible, interpret, kwargs, grid,
        )
    }
}

fn warn_if_unroutable(actions: &[Action]) {
    for action in actions {
        if let Action::Func { name, .. } = action {
            warn!(
                function = %name,
                "closure actions cannot travel to a grid node; register the function by name"
            );
        }
    }
}
