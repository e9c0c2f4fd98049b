//! Helper process execution and the command runner abstraction.
//!
//! Everything `transient` does to the outside world goes through external
//! binaries (`ssh`, `scp`, `qemu-img`, ...). This module owns the seam used
//! to invoke the run-to-completion ones so tests can substitute fakes; the
//! long-lived QEMU child has its own supervisor in the `qemu` module.

use std::ffi::OsString;
use std::io::Read;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use thiserror::Error;

const REAP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Raised when a helper program cannot be started.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("failed to spawn {program}: {message}")]
pub struct SpawnError {
    /// Command that failed to start.
    pub program: String,
    /// Operating system error string.
    pub message: String,
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError`] if the command cannot be started.
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, SpawnError>;

    /// Runs `program`, killing it when `deadline` elapses.
    ///
    /// A killed command reports no exit code; callers translate that into
    /// their own timeout error. The default implementation ignores the
    /// deadline, which suits scripted runners in tests.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError`] if the command cannot be started.
    fn run_with_deadline(
        &self,
        program: &str,
        args: &[OsString],
        deadline: Duration,
    ) -> Result<CommandOutput, SpawnError> {
        let _ = deadline;
        self.run(program, args)
    }
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, SpawnError> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|err| SpawnError {
                program: program.to_owned(),
                message: err.to_string(),
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn run_with_deadline(
        &self,
        program: &str,
        args: &[OsString],
        deadline: Duration,
    ) -> Result<CommandOutput, SpawnError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| SpawnError {
                program: program.to_owned(),
                message: err.to_string(),
            })?;

        let expiry = Instant::now() + deadline;
        let code = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status.code(),
                Ok(None) if Instant::now() >= expiry => {
                    child.kill().ok();
                    child.wait().ok();
                    break None;
                }
                Ok(None) => std::thread::sleep(REAP_POLL_INTERVAL),
                Err(err) => {
                    return Err(SpawnError {
                        program: program.to_owned(),
                        message: err.to_string(),
                    });
                }
            }
        };

        Ok(CommandOutput {
            code,
            stdout: drain_pipe(child.stdout.take()),
            stderr: drain_pipe(child.stderr.take()),
        })
    }
}

fn drain_pipe(pipe: Option<impl Read>) -> String {
    let mut contents = String::new();
    if let Some(mut handle) = pipe {
        let mut raw = Vec::new();
        if handle.read_to_end(&mut raw).is_ok() {
            contents = String::from_utf8_lossy(&raw).into_owned();
        }
    }
    contents
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_args(script: &str) -> Vec<OsString> {
        vec![OsString::from("-c"), OsString::from(script)]
    }

    #[test]
    fn process_runner_captures_output_and_code() {
        let output = ProcessCommandRunner
            .run("sh", &shell_args("printf out && printf err 1>&2; exit 4"))
            .unwrap_or_else(|err| panic!("run: {err}"));
        assert_eq!(output.code, Some(4));
        assert_eq!(output.stdout, "out");
        assert_eq!(output.stderr, "err");
        assert!(!output.is_success());
    }

    #[test]
    fn process_runner_reports_unspawnable_program() {
        let result = ProcessCommandRunner.run("definitely-not-a-real-binary-xyz", &[]);
        assert!(matches!(result, Err(SpawnError { .. })));
    }

    #[test]
    fn deadline_kills_overrunning_command() {
        let output = ProcessCommandRunner
            .run_with_deadline("sh", &shell_args("sleep 30"), Duration::from_millis(100))
            .unwrap_or_else(|err| panic!("run: {err}"));
        assert_eq!(output.code, None);
    }

    #[test]
    fn deadline_leaves_fast_command_untouched() {
        let output = ProcessCommandRunner
            .run_with_deadline("sh", &shell_args("printf done"), Duration::from_secs(5))
            .unwrap_or_else(|err| panic!("run: {err}"));
        assert_eq!(output.code, Some(0));
        assert_eq!(output.stdout, "done");
    }
}
