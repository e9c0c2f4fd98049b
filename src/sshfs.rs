//! Shared folders via sshfs in passive mode.
//!
//! The guest cannot reach back to a host SSH daemon (none is required to
//! run `transient`), so mounts run `sshfs` inside the guest in slave mode
//! while the host runs OpenSSH's `sftp-server`, with the two processes
//! cross-wired over the SSH channel's stdin/stdout. Both host-side children
//! stay alive for as long as the mount is needed and are reaped on drop.

use std::process::{Child, Command, Stdio};
use std::time::Duration;

use camino::Utf8PathBuf;
use shell_escape::unix::escape;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::process::{CommandRunner, SpawnError};
use crate::ssh::{SshClient, SshError};

const MOUNT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// One `LOCAL:REMOTE` shared folder.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SharedFolder {
    /// Absolute host directory to expose.
    pub local: Utf8PathBuf,
    /// Guest mount point.
    pub remote: String,
}

/// Errors raised while establishing a shared folder mount.
#[derive(Debug, Error)]
pub enum SshfsError {
    /// Raised when the host directory to share does not exist.
    #[error("shared folder source {path} is not a directory")]
    MissingLocalDir {
        /// Host path that was expected to exist.
        path: Utf8PathBuf,
    },
    /// Raised when a host-side helper process cannot be started.
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    /// Raised when the SSH channel for the mount exits before the mount
    /// appears.
    #[error("sshfs channel for {remote} exited early with status {status_text}")]
    ChannelClosed {
        /// Guest mount point the channel was serving.
        remote: String,
        /// Exit status of the SSH child.
        status_text: String,
    },
    /// Raised when the mount does not appear within the timeout.
    #[error("shared folder {remote} was not mounted within {timeout_secs} seconds")]
    MountTimeout {
        /// Guest mount point that never appeared.
        remote: String,
        /// Timeout that elapsed.
        timeout_secs: u64,
    },
    /// Raised when mount verification over SSH fails outright.
    #[error("failed to verify shared folder mount: {0}")]
    Verify(#[from] SshError),
}

/// Host-side process pair backing one mounted shared folder.
///
/// Dropping the mount kills both children; the guest side disappears with
/// the VM.
#[derive(Debug)]
pub struct SharedFolderMount {
    folder: SharedFolder,
    ssh_child: Child,
    sftp_child: Child,
}

impl SharedFolderMount {
    /// The folder this mount serves.
    #[must_use]
    pub const fn folder(&self) -> &SharedFolder {
        &self.folder
    }
}

impl Drop for SharedFolderMount {
    fn drop(&mut self) {
        self.ssh_child.kill().ok();
        self.ssh_child.wait().ok();
        self.sftp_child.kill().ok();
        self.sftp_child.wait().ok();
    }
}

/// The remote command that performs the guest-side mount.
fn remote_mount_command(folder: &SharedFolder) -> String {
    let local = escape(folder.local.as_str().into());
    let remote = escape(folder.remote.as_str().into());
    format!("sudo mkdir -p {remote} && sudo sshfs -o slave -o allow_other :{local} {remote}")
}

/// Establishes a shared folder mount and verifies it became visible.
///
/// # Errors
///
/// Returns [`SshfsError`] when the host directory is missing, a helper
/// process cannot be started, the SSH channel dies, or the mount does not
/// appear before `timeout`.
pub async fn mount_shared_folder<R: CommandRunner>(
    client: &SshClient<R>,
    sftp_server_bin: &str,
    folder: &SharedFolder,
    timeout: Duration,
) -> Result<SharedFolderMount, SshfsError> {
    if !folder.local.is_dir() {
        return Err(SshfsError::MissingLocalDir {
            path: folder.local.clone(),
        });
    }

    info!(local = %folder.local, remote = %folder.remote, "mounting shared folder");

    let ssh_config = client.config();
    let mut ssh_child = Command::new(&ssh_config.ssh_bin)
        .args(ssh_config.ssh_args(Some(&remote_mount_command(folder))))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|err| SpawnError {
            program: ssh_config.ssh_bin.clone(),
            message: err.to_string(),
        })?;

    let (Some(channel_out), Some(channel_in)) = (ssh_child.stdout.take(), ssh_child.stdin.take())
    else {
        ssh_child.kill().ok();
        return Err(SshfsError::Spawn(SpawnError {
            program: ssh_config.ssh_bin.clone(),
            message: String::from("sshfs channel pipes were not created"),
        }));
    };

    let sftp_child = match Command::new(sftp_server_bin)
        .stdin(Stdio::from(channel_out))
        .stdout(Stdio::from(channel_in))
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            ssh_child.kill().ok();
            return Err(SshfsError::Spawn(SpawnError {
                program: sftp_server_bin.to_owned(),
                message: err.to_string(),
            }));
        }
    };

    let mut mount = SharedFolderMount {
        folder: folder.clone(),
        ssh_child,
        sftp_child,
    };
    wait_for_mount(client, &mut mount, timeout).await?;
    Ok(mount)
}

async fn wait_for_mount<R: CommandRunner>(
    client: &SshClient<R>,
    mount: &mut SharedFolderMount,
    timeout: Duration,
) -> Result<(), SshfsError> {
    let remote = escape(mount.folder.remote.as_str().into()).into_owned();
    let probe = format!("mountpoint -q {remote}");
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if let Ok(Some(status)) = mount.ssh_child.try_wait() {
            return Err(SshfsError::ChannelClosed {
                remote: mount.folder.remote.clone(),
                status_text: status
                    .code()
                    .map_or_else(|| String::from("unknown"), |code| code.to_string()),
            });
        }

        let verified = client.run_command(&probe)?;
        if verified.is_success() {
            info!(remote = %mount.folder.remote, "shared folder mounted");
            return Ok(());
        }

        if tokio::time::Instant::now() >= deadline {
            warn!(remote = %mount.folder.remote, "shared folder mount timed out");
            return Err(SshfsError::MountTimeout {
                remote: mount.folder.remote.clone(),
                timeout_secs: timeout.as_secs(),
            });
        }
        sleep(MOUNT_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_mount_command_quotes_both_paths() {
        let folder = SharedFolder {
            local: Utf8PathBuf::from("/home/user/my project"),
            remote: String::from("/mnt/project"),
        };
        assert_eq!(
            remote_mount_command(&folder),
            "sudo mkdir -p /mnt/project && sudo sshfs -o slave -o allow_other :'/home/user/my project' /mnt/project"
        );
    }

    #[tokio::test]
    async fn missing_local_directory_is_rejected_before_spawning() {
        use crate::config::RunConfig;
        use crate::ssh::SshConfig;
        use crate::test_support::ScriptedRunner;

        let run_config = RunConfig::defaults();
        let runner = ScriptedRunner::new();
        let client = SshClient::new(SshConfig::for_guest(&run_config, 8022), runner.clone());

        let folder = SharedFolder {
            local: Utf8PathBuf::from("/definitely/not/a/real/dir"),
            remote: String::from("/mnt/project"),
        };
        let result = mount_shared_folder(
            &client,
            &run_config.sftp_server_bin,
            &folder,
            Duration::from_secs(1),
        )
        .await;

        assert!(matches!(result, Err(SshfsError::MissingLocalDir { .. })));
        assert!(runner.invocations().is_empty(), "no probe should have run");
    }
}
