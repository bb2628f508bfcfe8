//! anadama-process: spawning and managing shell children.
//!
//! Every shell action runs through here: the command is handed to the
//! operating-system shell in its own process group (so that a kill tears
//! down the whole pipeline, not just the shell), stdout and stderr are
//! piped back, and the exit status is normalised into [`ChildExit`].

use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("unable to spawn shell for `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("unable to collect output of `{command}`: {source}")]
    Wait {
        command: String,
        source: std::io::Error,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChildExit {
    Finished(i32),
    /// The child was terminated by a signal before reporting a status.
    Killed,
}

impl ChildExit {
    pub fn success(&self) -> bool {
        matches!(self, ChildExit::Finished(0))
    }
}

/// Captured result of a finished shell command.
#[derive(Debug)]
pub struct ShellOutput {
    pub exit: ChildExit,
    pub stdout: String,
    pub stderr: String,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.exit.success()
    }
}

/// A spawned shell command. The child runs in its own session/process
/// group; [`ShellChild::kill`] signals the whole group so that pipelines
/// and grandchildren do not leak past the engine's teardown.
pub struct ShellChild {
    command: String,
    child: tokio::process::Child,
    pid: Option<u32>,
}

impl ShellChild {
    pub fn spawn(command: impl Into<String>) -> Result<Self, ProcessError> {
        let command = command.into();
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Put the child in its own session so the group can be signalled
        #[cfg(unix)]
        {
            use nix::unistd::setsid;
            unsafe {
                cmd.pre_exec(|| {
                    setsid().map_err(std::io::Error::from)?;
                    Ok(())
                });
            }
        }

        let child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            command: command.clone(),
            source,
        })?;
        let pid = child.id();
        debug!(?pid, command = %command, "spawned shell child");
        Ok(Self {
            command,
            child,
            pid,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Wait for the child and collect its output.
    pub async fn wait_with_output(self) -> Result<ShellOutput, ProcessError> {
        let ShellChild {
            command, child, ..
        } = self;
        let output = child
            .wait_with_output()
            .await
            .map_err(|source| ProcessError::Wait { command, source })?;
        let exit = match output.status.code() {
            Some(code) => ChildExit::Finished(code),
            None => ChildExit::Killed,
        };
        Ok(ShellOutput {
            exit,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Signal the child's whole process group with SIGKILL.
    pub fn kill_group(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                debug!(?pid, error = %e, "unable to kill process group");
            }
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.start_kill();
        }
    }
}

/// Run a shell command to completion, capturing output.
pub async fn run_shell(command: impl Into<String>) -> Result<ShellOutput, ProcessError> {
    ShellChild::spawn(command)?.wait_with_output().await
}

#[cfg(test)]
mod test {
    use test_case::test_case;

    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_stderr() {
        let out = run_shell("echo hello; echo oops >&2").await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.stderr, "oops\n");
    }

    #[test_case("exit 0", 0; "clean exit")]
    #[test_case("exit 3", 3; "nonzero exit")]
    #[test_case("no-such-program-xyz", 127; "missing program")]
    #[tokio::test]
    async fn exit_codes_are_reported(command: &str, code: i32) {
        let out = run_shell(command).await.unwrap();
        assert_eq!(out.exit, ChildExit::Finished(code));
    }

    #[tokio::test]
    async fn shell_pipelines_work() {
        let out = run_shell("printf 'a\\nb\\nc\\n' | wc -l").await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "3");
    }
}
