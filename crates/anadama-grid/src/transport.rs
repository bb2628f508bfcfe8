//! Work-unit transport: executing a task in another process.
//!
//! A task bound for a grid node (or any subprocess) is serialised into a
//! JSON work unit: its shell commands, named-function actions, and target
//! specs. The driver writes the unit next to a result path, arranges for
//! the remote process to re-invoke the current executable with
//! [`WORK_UNIT_FLAG`], and polls for the result blob once the queue says
//! the job stopped.
//!
//! Closures cannot travel between processes; function actions must be
//! registered by name in a [`FunctionRegistry`] on both ends.

use std::{collections::BTreeMap, fs, sync::Arc, time::Duration};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use anadama_tracked::{Fingerprint, Tracked, TrackedSpec};

/// Sentinel first argument that turns a process into a work-unit runner.
pub const WORK_UNIT_FLAG: &str = "__anadama-work-unit";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unable to write work unit to `{path}`: {source}")]
    Write {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
    #[error("unable to read `{path}`: {source}")]
    Read {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
    #[error("work unit at `{path}` is not valid JSON: {source}")]
    Decode {
        path: Utf8PathBuf,
        source: serde_json::Error,
    },
    #[error("unable to encode work unit: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("timed out waiting for result file `{0}`")]
    ResultTimeout(Utf8PathBuf),
    #[error("task uses an in-process closure action; register the function by name to run it on a grid")]
    UnsendableAction,
}

/// An action in wire form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireAction {
    /// A shell command, run by the operating-system shell.
    Shell { command: String },
    /// A registered function, looked up by name and given its arguments.
    Named {
        name: String,
        #[serde(default)]
        args: serde_json::Value,
    },
}

/// A task serialised for execution in another process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    pub task_no: usize,
    pub name: String,
    pub actions: Vec<WireAction>,
    pub targets: Vec<TrackedSpec>,
    #[serde(default)]
    pub kwargs: BTreeMap<String, String>,
}

/// The wire form of a task result, mirrored into the engine's result
/// type on the way back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkResult {
    pub task_no: usize,
    /// Empty on success.
    pub error: String,
    pub dep_keys: Vec<String>,
    pub dep_compares: Vec<Vec<Fingerprint>>,
}

impl WorkResult {
    pub fn failed(task_no: usize, error: impl Into<String>) -> Self {
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

type NamedAction = dyn Fn(&serde_json::Value) -> Result<(), String> + Send + Sync;

/// Named functions that may be referenced by [`WireAction::Named`].
/// Binaries that dispatch function actions to a grid register the same
/// functions on both the submitting and the executing side.
#[derive(Default, Clone)]
pub struct FunctionRegistry {
    funcs: BTreeMap<String, Arc<NamedAction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, func: F) -> &mut Self
    where
        F: Fn(&serde_json::Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.funcs.insert(name.into(), Arc::new(func));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<NamedAction>> {
        self.funcs.get(name)
    }
}

/// Paths of a materialised work unit.
#[derive(Debug, Clone)]
pub struct WorkFiles {
    pub unit_path: Utf8PathBuf,
    pub result_path: Utf8PathBuf,
}

impl WorkFiles {
    /// The command the remote process runs to execute the unit.
    pub fn run_command(&self) -> String {
        let exe = std::env::current_exe()
            .ok()
            .and_then(|p| p.to_str().map(str::to_owned))
            .unwrap_or_else(|| "anadama".to_owned());
        format!("{exe} {WORK_UNIT_FLAG} {} {}", self.unit_path, self.result_path)
    }
}

/// Write `unit` into `tmpdir`, returning the blob paths.
pub fn materialize(unit: &WorkUnit, tmpdir: &Utf8Path) -> Result<WorkFiles, TransportError> {
    fs::create_dir_all(tmpdir).map_err(|source| TransportError::Write {
        path: tmpdir.to_owned(),
        source,
    })?;
    let stem = format!("task{}_{}", unit.task_no, std::process::id());
    let unit_path = unique_path(tmpdir, &stem, "input.json");
    let result_path = unique_path(tmpdir, &stem, "output.json");

    let encoded = serde_json::to_vec_pretty(unit)?;
    fs::write(&unit_path, encoded).map_err(|source| TransportError::Write {
        path: unit_path.clone(),
        source,
    })?;
    debug!(task_no = unit.task_no, unit = %unit_path, "materialized work unit");
    Ok(WorkFiles {
        unit_path,
        result_path,
    })
}

fn unique_path(dir: &Utf8Path, stem: &str, suffix: &str) -> Utf8PathBuf {
    let mut n = 0u32;
    loop {
        let candidate = if n == 0 {
            dir.join(format!("{stem}_{suffix}"))
        } else {
            dir.join(format!("{stem}_{n}_{suffix}"))
        };
        if !candidate.as_std_path().exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Execute a work unit in this process and return its result. This is
/// the remote half of the transport, also used directly by subprocess
/// workers.
pub fn run_work_unit(unit: &WorkUnit, registry: &FunctionRegistry) -> WorkResult {
    for (i, action) in unit.actions.iter().enumerate() {
        let failure = match action {
            WireAction::Shell { command } => run_shell_action(command),
            WireAction::Named { name, args } => match registry.get(name) {
                Some(func) => func(args).err(),
                None => Some(format!("no function registered under `{name}`")),
            },
        };
        if let Some(message) = failure {
            return WorkResult::failed(
                unit.task_no,
                format!("Error executing action {i}. {message}"),
            );
        }
    }

    let mut dep_keys = Vec::with_capacity(unit.targets.len());
    let mut dep_compares = Vec::with_capacity(unit.targets.len());
    for spec in &unit.targets {
        let tracked = Tracked::from(spec.clone());
        match tracked.compare().collect::<Result<Vec<_>, _>>() {
            Ok(atoms) => {
                dep_keys.push(tracked.name().to_owned());
                dep_compares.push(atoms);
            }
            Err(e) => {
                return WorkResult::failed(
                    unit.task_no,
                    format!("Failed to produce target `{}': {e}", tracked.name()),
                );
            }
        }
    }

    WorkResult {
        task_no: unit.task_no,
        error: String::new(),
        dep_keys,
        dep_compares,
    }
}

fn run_shell_action(command: &str) -> Option<String> {
    let output = match std::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
    {
        Ok(output) => output,
        Err(e) => return Some(format!("unable to spawn shell: {e}")),
    };
    if output.status.success() {
        return None;
    }
    Some(format!(
        "command `{command}` exited with {}\nstdout:\n{}\nstderr:\n{}",
        output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_owned()),
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr),
    ))
}

/// Load a unit from `unit_path`, run it, and write the result blob.
pub fn run_work_unit_files(
    unit_path: &Utf8Path,
    result_path: &Utf8Path,
    registry: &FunctionRegistry,
) -> Result<WorkResult, TransportError> {
    let raw = fs::read(unit_path).map_err(|source| TransportError::Read {
        path: unit_path.to_owned(),
        source,
    })?;
    let unit: WorkUnit = serde_json::from_slice(&raw).map_err(|source| TransportError::Decode {
        path: unit_path.to_owned(),
        source,
    })?;
    let result = run_work_unit(&unit, registry);
    let encoded = serde_json::to_vec_pretty(&result)?;
    fs::write(result_path, encoded).map_err(|source| TransportError::Write {
        path: result_path.to_owned(),
        source,
    })?;
    Ok(result)
}

/// If this process was invoked as a work-unit runner, execute the unit
/// and exit. Call early in `main` of any binary that submits function
/// actions to a grid.
pub fn maybe_run_work_unit(registry: &FunctionRegistry) {
    let args: Vec<String> = std::env::args().collect();
    if args.len() == 4 && args[1] == WORK_UNIT_FLAG {
        let unit_path = Utf8PathBuf::from(&args[2]);
        let result_path = Utf8PathBuf::from(&args[3]);
        let code = match run_work_unit_files(&unit_path, &result_path, registry) {
            Ok(result) if result.is_success() => 0,
            Ok(_) => 1,
            Err(e) => {
                eprintln!("anadama work unit failed: {e}");
                2
            }
        };
        std::process::exit(code);
    }
}

/// Poll for the result blob the remote process writes, deserialising it
/// once present.
pub async fn collect_result(
    result_path: &Utf8Path,
    timeout: Duration,
) -> Result<WorkResult, TransportError> {
    let poll = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    loop {
        if result_path.as_std_path().exists() {
            let raw = fs::read(result_path).map_err(|source| TransportError::Read {
                path: result_path.to_owned(),
                source,
            })?;
            return serde_json::from_slice(&raw).map_err(|source| TransportError::Decode {
                path: result_path.to_owned(),
                source,
            });
        }
        if waited >= timeout {
            return Err(TransportError::ResultTimeout(result_path.to_owned()));
        }
        tokio::time::sleep(poll).await;
        waited += poll;
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    fn shell_unit(task_no: usize, command: &str, targets: Vec<TrackedSpec>) -> WorkUnit {
        WorkUnit {
            task_no,
            name: command.to_owned(),
            actions: vec![WireAction::Shell {
                command: command.to_owned(),
            }],
            targets,
            kwargs: BTreeMap::new(),
        }
    }

    #[test]
    fn shell_unit_produces_target_fingerprints() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("made.txt");
        let out_str = out.to_str().unwrap();

        let unit = shell_unit(
            7,
            &format!("echo made > {out_str}"),
            vec![TrackedSpec::HugeFile {
                path: out_str.into(),
            }],
        );
        let result = run_work_unit(&unit, &FunctionRegistry::new());
        assert!(result.is_success(), "{}", result.error);
        assert_eq!(result.task_no, 7);
        assert_eq!(result.dep_keys, vec![out_str.to_owned()]);
        assert_eq!(result.dep_compares[0].len(), 2);
    }

    #[test]
    fn failing_action_reports_its_index_and_output() {
        let unit = shell_unit(0, "echo doomed >&2; exit 9", vec![]);
        let result = run_work_unit(&unit, &FunctionRegistry::new());
        assert!(!result.is_success());
        assert!(result.error.contains("Error executing action 0"));
        assert!(result.error.contains("doomed"));
    }

    #[test]
    fn missing_target_downgrades_success_to_failure() {
        let unit = shell_unit(
            1,
            "true",
            vec![TrackedSpec::HugeFile {
                path: "/no/such/target.txt".into(),
            }],
        );
        let result = run_work_unit(&unit, &FunctionRegistry::new());
        assert!(result.error.contains("Failed to produce target"));
    }

    #[test]
    fn named_actions_resolve_through_the_registry() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let marker_str = marker.to_str().unwrap().to_owned();

        let mut registry = FunctionRegistry::new();
        registry.register("touch-marker", move |args| {
            let path = args
                .get("path")
                .and_then(|v| v.as_str())
                .ok_or("missing path arg")?;
            fs::write(path, b"x").map_err(|e| e.to_string())
        });

        let unit = WorkUnit {
            task_no: 2,
            name: "named".into(),
            actions: vec![WireAction::Named {
                name: "touch-marker".into(),
                args: serde_json::json!({ "path": marker_str }),
            }],
            targets: vec![],
            kwargs: BTreeMap::new(),
        };
        let result = run_work_unit(&unit, &registry);
        assert!(result.is_success(), "{}", result.error);
        assert!(marker.exists());

        let unregistered = WorkUnit {
            actions: vec![WireAction::Named {
                name: "never-registered".into(),
                args: serde_json::Value::Null,
            }],
            ..unit
        };
        let result = run_work_unit(&unregistered, &registry);
        assert!(result.error.contains("never-registered"));
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = Utf8PathBuf::from(dir.path().to_str().unwrap());
        let unit = shell_unit(3, "true", vec![]);

        let files = materialize(&unit, &tmp).unwrap();
        let result =
            run_work_unit_files(&files.unit_path, &files.result_path, &FunctionRegistry::new())
                .unwrap();
        assert!(result.is_success());

        let raw = fs::read(&files.result_path).unwrap();
        let reloaded: WorkResult = serde_json::from_slice(&raw).unwrap();
        assert_eq!(reloaded.task_no, 3);
    }

    #[tokio::test]
    async fn collect_result_times_out_without_a_blob() {
        let dir = tempfile::tempdir().unwrap();
        let missing = Utf8PathBuf::from(dir.path().to_str().unwrap()).join("never.json");
        let err = collect_result(&missing, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ResultTimeout(_)));
    }
}
