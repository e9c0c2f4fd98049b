//! SSH plumbing for reaching the guest.
//!
//! User-mode QEMU networking exposes the guest's port 22 on a forwarded
//! localhost port, so every connection here is `user@localhost -p PORT` with
//! host-key checking disabled: the host is throwaway by definition and its
//! key changes on every boot. Command execution goes through the
//! [`CommandRunner`] seam; only the interactive console talks to the
//! terminal directly.

use std::ffi::OsString;
use std::time::Duration;

use shell_escape::unix::escape;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::config::{RunConfig, expand_tilde};
use crate::process::{CommandOutput, CommandRunner, SpawnError};

const READY_POLL_INTERVAL: Duration = Duration::from_secs(2);
const READY_PROBE_COMMAND: &str = "true";
const SHUTDOWN_COMMAND: &str = "sudo shutdown -h now";
const SHUTDOWN_COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

/// Connection details for one guest.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshConfig {
    /// Hostname to connect to; always `localhost` for user-mode networking.
    pub host: String,
    /// Forwarded host port reaching guest port 22.
    pub port: u16,
    /// Remote user to authenticate as.
    pub user: String,
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    pub scp_bin: String,
    /// Optional SSH private key path; supports tilde expansion.
    pub identity_file: Option<String>,
    /// Per-attempt TCP connect timeout, in seconds.
    pub connect_timeout_secs: u64,
}

impl SshConfig {
    /// Builds a guest connection config from the `[run]` settings and the
    /// forwarded port chosen for this VM.
    #[must_use]
    pub fn for_guest(config: &RunConfig, port: u16) -> Self {
        Self {
            host: String::from("localhost"),
            port,
            user: config.ssh_user.clone(),
            ssh_bin: config.ssh_bin.clone(),
            scp_bin: config.scp_bin.clone(),
            identity_file: config.ssh_identity_file.clone(),
            connect_timeout_secs: 5,
        }
    }

    /// `user@host` destination string.
    #[must_use]
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    fn common_options(&self) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-o"),
            OsString::from("BatchMode=yes"),
            OsString::from("-o"),
            OsString::from("StrictHostKeyChecking=no"),
            OsString::from("-o"),
            OsString::from("UserKnownHostsFile=/dev/null"),
            OsString::from("-o"),
            OsString::from(format!("ConnectTimeout={}", self.connect_timeout_secs)),
        ];
        if let Some(identity_file) = &self.identity_file {
            args.push(OsString::from("-i"));
            args.push(OsString::from(expand_tilde(identity_file)));
        }
        args
    }

    pub(crate) fn ssh_args(&self, remote_command: Option<&str>) -> Vec<OsString> {
        let mut args = vec![OsString::from("-p"), OsString::from(self.port.to_string())];
        args.extend(self.common_options());
        args.push(OsString::from(self.destination()));
        if let Some(command) = remote_command {
            args.push(OsString::from(command));
        }
        args
    }

    fn scp_args(&self, source: &str, dest: &str) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-r"),
            OsString::from("-P"),
            OsString::from(self.port.to_string()),
        ];
        args.extend(self.common_options());
        args.push(OsString::from(source));
        args.push(OsString::from(dest));
        args
    }

    fn remote_path(&self, path: &str) -> String {
        // The remote side of scp goes through a shell; quote the path.
        format!("{}:{}", self.destination(), escape(path.into()))
    }
}

/// Errors surfaced by guest SSH operations.
#[derive(Debug, Error)]
pub enum SshError {
    /// Raised when an `ssh`/`scp` process cannot be started.
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    /// Raised when the guest SSH endpoint never becomes reachable.
    #[error("guest SSH did not become reachable within {timeout_secs} seconds")]
    ReadyTimeout {
        /// Overall readiness timeout that elapsed.
        timeout_secs: u64,
    },
    /// Raised when an interactive session ends without an exit status.
    #[error("SSH session terminated without an exit status")]
    SessionTerminated,
    /// Raised when a file transfer exceeds its timeout.
    #[error("copying {src} to {dest} did not finish within {timeout_secs} seconds")]
    CopyTimeout {
        /// Transfer source as given to `scp`.
        src: String,
        /// Transfer destination as given to `scp`.
        dest: String,
        /// Copy timeout that elapsed.
        timeout_secs: u64,
    },
    /// Raised when `scp` exits with a non-zero status.
    #[error("{program} exited with status {status}: {stderr}")]
    CopyFailure {
        /// Program that was invoked.
        program: String,
        /// Exit status reported by the OS.
        status: i32,
        /// Stderr captured from the process.
        stderr: String,
    },
}

/// Client for running commands in and copying files to a guest.
#[derive(Clone, Debug)]
pub struct SshClient<R: CommandRunner> {
    config: SshConfig,
    runner: R,
    ready_poll_interval: Duration,
}

impl<R: CommandRunner> SshClient<R> {
    /// Creates a client from connection details and a command runner.
    #[must_use]
    pub const fn new(config: SshConfig, runner: R) -> Self {
        Self {
            config,
            runner,
            ready_poll_interval: READY_POLL_INTERVAL,
        }
    }

    /// Overrides the readiness poll interval.
    ///
    /// This is primarily used by tests to keep timeout scenarios fast.
    #[must_use]
    pub const fn with_ready_poll_interval(mut self, interval: Duration) -> Self {
        self.ready_poll_interval = interval;
        self
    }

    /// Returns the connection details this client was built with.
    #[must_use]
    pub const fn config(&self) -> &SshConfig {
        &self.config
    }

    /// Polls the guest until a trivial remote command succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::ReadyTimeout`] when the deadline passes and
    /// [`SshError::Spawn`] when the `ssh` binary cannot be started at all.
    pub async fn wait_for_ready(&self, timeout: Duration) -> Result<(), SshError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut attempts: u32 = 0;

        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(SshError::ReadyTimeout {
                    timeout_secs: timeout.as_secs(),
                });
            }

            attempts += 1;
            let output = self.run_command(READY_PROBE_COMMAND)?;
            if output.is_success() {
                info!(port = self.config.port, attempts, "guest SSH is ready");
                return Ok(());
            }

            debug!(
                port = self.config.port,
                attempts,
                status = ?output.code,
                "guest SSH not ready yet"
            );
            sleep(self.ready_poll_interval).await;
        }
    }

    /// Runs `remote_command` over SSH, capturing its output.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Spawn`] when the `ssh` binary cannot be started.
    pub fn run_command(&self, remote_command: &str) -> Result<CommandOutput, SshError> {
        let args = self.config.ssh_args(Some(remote_command));
        Ok(self.runner.run(&self.config.ssh_bin, &args)?)
    }

    /// Attaches the caller's terminal to the guest: a login shell, or
    /// `remote_command` when given. Returns the remote exit code.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Spawn`] when the `ssh` binary cannot be started
    /// and [`SshError::SessionTerminated`] when the session ends without an
    /// exit status.
    pub fn connect_console(&self, remote_command: Option<&str>) -> Result<i32, SshError> {
        let args = self.config.ssh_args(remote_command);
        let status = std::process::Command::new(&self.config.ssh_bin)
            .args(&args)
            .status()
            .map_err(|err| SpawnError {
                program: self.config.ssh_bin.clone(),
                message: err.to_string(),
            })?;
        status.code().ok_or(SshError::SessionTerminated)
    }

    /// Copies a host path into the guest with `scp -r`.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::CopyTimeout`] when the deadline passes,
    /// [`SshError::CopyFailure`] on a non-zero exit, and
    /// [`SshError::Spawn`] when `scp` cannot be started.
    pub fn copy_in(&self, local: &str, remote: &str, timeout: Duration) -> Result<(), SshError> {
        let dest = self.config.remote_path(remote);
        self.copy(local.to_owned(), dest, timeout)
    }

    /// Copies a guest path back to the host with `scp -r`.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::CopyTimeout`] when the deadline passes,
    /// [`SshError::CopyFailure`] on a non-zero exit, and
    /// [`SshError::Spawn`] when `scp` cannot be started.
    pub fn copy_out(&self, remote: &str, local: &str, timeout: Duration) -> Result<(), SshError> {
        let source = self.config.remote_path(remote);
        self.copy(source, local.to_owned(), timeout)
    }

    /// Asks the guest to power off.
    ///
    /// The request is best-effort: the caller enforces the real deadline by
    /// waiting on (and if needed killing) the QEMU process, so a failed
    /// shutdown command is reported, not fatal.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Spawn`] when the `ssh` binary cannot be started.
    pub fn shutdown(&self) -> Result<CommandOutput, SshError> {
        info!(port = self.config.port, "requesting guest shutdown over SSH");
        let args = self.config.ssh_args(Some(SHUTDOWN_COMMAND));
        Ok(self
            .runner
            .run_with_deadline(&self.config.ssh_bin, &args, SHUTDOWN_COMMAND_TIMEOUT)?)
    }

    fn copy(&self, source: String, dest: String, timeout: Duration) -> Result<(), SshError> {
        info!(%source, %dest, "copying files");
        let args = self.config.scp_args(&source, &dest);
        let output = self
            .runner
            .run_with_deadline(&self.config.scp_bin, &args, timeout)?;

        match output.code {
            Some(0) => Ok(()),
            Some(status) => Err(SshError::CopyFailure {
                program: self.config.scp_bin.clone(),
                status,
                stderr: output.stderr,
            }),
            None => Err(SshError::CopyTimeout {
                src: source,
                dest,
                timeout_secs: timeout.as_secs(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;

    fn config() -> SshConfig {
        SshConfig {
            host: String::from("localhost"),
            port: 8022,
            user: String::from("vagrant"),
            ssh_bin: String::from("ssh"),
            scp_bin: String::from("scp"),
            identity_file: None,
            connect_timeout_secs: 5,
        }
    }

    fn client(runner: &ScriptedRunner) -> SshClient<ScriptedRunner> {
        SshClient::new(config(), runner.clone())
            .with_ready_poll_interval(Duration::from_millis(1))
    }

    #[test]
    fn ssh_args_disable_host_key_checks_for_throwaway_guests() {
        let args = config().ssh_args(Some("uname -a"));
        let rendered = args
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        assert_eq!(
            rendered,
            "-p 8022 -o BatchMode=yes -o StrictHostKeyChecking=no \
             -o UserKnownHostsFile=/dev/null -o ConnectTimeout=5 \
             vagrant@localhost uname -a"
        );
    }

    #[test]
    fn ssh_args_include_expanded_identity_file() {
        let with_identity = SshConfig {
            identity_file: Some(String::from("/keys/id_ed25519")),
            ..config()
        };
        let args = with_identity.ssh_args(None);
        let rendered = args
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        assert!(rendered.iter().any(|arg| arg == "-i"));
        assert!(rendered.iter().any(|arg| arg == "/keys/id_ed25519"));
        assert_eq!(rendered.last().map(String::as_str), Some("vagrant@localhost"));
    }

    #[test]
    fn scp_remote_paths_are_shell_quoted() {
        let dest = config().remote_path("/tmp/with space");
        assert_eq!(dest, "vagrant@localhost:'/tmp/with space'");
    }

    #[tokio::test]
    async fn wait_for_ready_retries_until_success() {
        let runner = ScriptedRunner::new();
        runner.push_failure(255);
        runner.push_failure(255);
        runner.push_success();

        let ssh = client(&runner);
        ssh.wait_for_ready(Duration::from_secs(5))
            .await
            .unwrap_or_else(|err| panic!("wait for ready: {err}"));

        assert_eq!(runner.invocations().len(), 3);
    }

    #[tokio::test]
    async fn wait_for_ready_times_out_without_probing_past_deadline() {
        let runner = ScriptedRunner::new();
        let ssh = client(&runner);

        let result = ssh.wait_for_ready(Duration::ZERO).await;
        assert!(matches!(result, Err(SshError::ReadyTimeout { .. })));
        assert!(runner.invocations().is_empty());
    }

    #[test]
    fn copy_in_builds_recursive_scp_invocation() {
        let runner = ScriptedRunner::new();
        runner.push_success();

        let ssh = client(&runner);
        ssh.copy_in("./artifacts", "/srv/artifacts", Duration::from_secs(30))
            .unwrap_or_else(|err| panic!("copy in: {err}"));

        let invocations = runner.invocations();
        assert_eq!(invocations.len(), 1);
        let command = invocations
            .first()
            .map(crate::test_support::CommandInvocation::command_string)
            .unwrap_or_default();
        assert!(command.starts_with("scp -r -P 8022"), "command: {command}");
        assert!(
            command.ends_with("./artifacts vagrant@localhost:/srv/artifacts"),
            "command: {command}"
        );
    }

    #[test]
    fn copy_out_surfaces_scp_failures() {
        let runner = ScriptedRunner::new();
        runner.push_failure(1);

        let ssh = client(&runner);
        let result = ssh.copy_out("/var/log/app.log", "./logs", Duration::from_secs(30));
        assert!(matches!(result, Err(SshError::CopyFailure { status: 1, .. })));
    }

    #[test]
    fn copy_without_exit_code_is_a_timeout() {
        let runner = ScriptedRunner::new();
        runner.push_missing_exit_code();

        let ssh = client(&runner);
        let result = ssh.copy_in("./a", "/b", Duration::from_secs(1));
        assert!(matches!(result, Err(SshError::CopyTimeout { .. })));
    }

    #[test]
    fn shutdown_sends_poweroff_command() {
        let runner = ScriptedRunner::new();
        runner.push_success();

        let ssh = client(&runner);
        ssh.shutdown().unwrap_or_else(|err| panic!("shutdown: {err}"));

        let command = runner
            .invocations()
            .first()
            .map(crate::test_support::CommandInvocation::command_string)
            .unwrap_or_default();
        assert!(
            command.ends_with("vagrant@localhost sudo shutdown -h now"),
            "command: {command}"
        );
    }
}
