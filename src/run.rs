//! Orchestrates end-to-end VM runs.
//!
//! The run workflow prepares per-VM disk images, assembles the QEMU argument
//! vector, boots the VM, waits for SSH readiness when anything needs the
//! guest network, performs copies and shared folder mounts, hands the
//! terminal to SSH, and finally shuts the guest down and reaps QEMU. SSH
//! exit codes are preserved so callers observe the remote status locally.

use std::net::TcpListener;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{ConfigError, RunConfig};
use crate::image::{ImageInfo, ImageStore, ImageStoreError};
use crate::process::CommandRunner;
use crate::qemu::{QemuError, QemuRunner};
use crate::ssh::{SshClient, SshConfig, SshError};
use crate::sshfs::{SharedFolder, SharedFolderMount, SshfsError, mount_shared_folder};

const SSH_NETDEV_ID: &str = "transient-sshdev";
const GUEST_SSH_PORT: u16 = 22;

/// One copy transfer; directional meaning depends on the flag it came from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CopyPair {
    /// Transfer source (host path for copy-in, guest path for copy-out).
    pub from: String,
    /// Transfer destination.
    pub to: String,
}

/// Everything `transient run` needs to know about one VM.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RunRequest {
    /// VM name used to key frontend images.
    pub vm_name: String,
    /// Raw image specs in boot order.
    pub images: Vec<String>,
    /// Stop after image preparation.
    pub prepare_only: bool,
    /// Attach the terminal over SSH instead of the serial console.
    pub ssh_console: bool,
    /// Attach over SSH but keep forwarding serial output until then.
    pub ssh_with_serial: bool,
    /// Run a single remote command instead of an interactive session.
    pub ssh_command: Option<String>,
    /// Host directories to mount in the guest.
    pub shared_folders: Vec<SharedFolder>,
    /// Host-to-guest copies performed before the session.
    pub copy_in_before: Vec<CopyPair>,
    /// Guest-to-host copies performed after the session.
    pub copy_out_after: Vec<CopyPair>,
    /// Extra arguments appended to the QEMU invocation.
    pub qemu_args: Vec<String>,
}

impl RunRequest {
    /// Whether this run needs the forwarded SSH port at all.
    #[must_use]
    pub fn needs_ssh(&self) -> bool {
        self.needs_ssh_console()
            || !self.shared_folders.is_empty()
            || !self.copy_in_before.is_empty()
            || !self.copy_out_after.is_empty()
    }

    /// Whether the terminal should be handed to SSH.
    #[must_use]
    pub const fn needs_ssh_console(&self) -> bool {
        self.ssh_console || self.ssh_with_serial || self.ssh_command.is_some()
    }
}

/// Generates a VM name when none was given.
#[must_use]
pub fn generated_vm_name() -> String {
    format!("transient-{}", Uuid::new_v4().simple())
}

/// Parses a `LOCAL:REMOTE` shared folder spec, making the host side
/// absolute.
///
/// # Errors
///
/// Returns [`RunError::InvalidPathSpec`] for malformed specs and
/// [`RunError::WorkingDirectory`] when the current directory cannot be
/// resolved to anchor a relative path.
pub fn parse_shared_folder(raw: &str) -> Result<SharedFolder, RunError> {
    let (local, remote) = split_path_spec(raw)?;
    Ok(SharedFolder {
        local: absolute_path(&local)?,
        remote,
    })
}

/// Parses a copy spec of the form `FROM:TO`.
///
/// # Errors
///
/// Returns [`RunError::InvalidPathSpec`] when either half is empty.
pub fn parse_copy_pair(raw: &str) -> Result<CopyPair, RunError> {
    let (from, to) = split_path_spec(raw)?;
    Ok(CopyPair { from, to })
}

fn split_path_spec(raw: &str) -> Result<(String, String), RunError> {
    let invalid = || RunError::InvalidPathSpec {
        spec: raw.to_owned(),
    };
    let (first, second) = raw.split_once(':').ok_or_else(invalid)?;
    if first.trim().is_empty() || second.trim().is_empty() {
        return Err(invalid());
    }
    Ok((first.trim().to_owned(), second.trim().to_owned()))
}

fn absolute_path(raw: &str) -> Result<Utf8PathBuf, RunError> {
    let path = Utf8Path::new(raw);
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    // A relative path is almost certainly not what the guest-side mount
    // should see; anchor it to the current directory.
    let cwd = std::env::current_dir().map_err(|err| RunError::WorkingDirectory {
        message: err.to_string(),
    })?;
    let cwd = Utf8PathBuf::from_path_buf(cwd).map_err(|path_buf| RunError::WorkingDirectory {
        message: format!("current directory is not UTF-8: {}", path_buf.display()),
    })?;
    Ok(cwd.join(path))
}

/// Errors surfaced while performing a VM run.
#[derive(Debug, Error)]
pub enum RunError {
    /// Raised when configuration validation fails.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Raised when image preparation fails.
    #[error("failed to prepare disk images: {0}")]
    Image(#[from] ImageStoreError),
    /// Raised when the QEMU child cannot be managed.
    #[error(transparent)]
    Qemu(#[from] QemuError),
    /// Raised when a `LOCAL:REMOTE` style spec cannot be parsed.
    #[error("invalid path spec {spec:?}: expected the form FROM:TO")]
    InvalidPathSpec {
        /// The raw spec as given on the command line.
        spec: String,
    },
    /// Raised when the current working directory cannot be used to anchor a
    /// relative path.
    #[error("failed to resolve working directory: {message}")]
    WorkingDirectory {
        /// Operating system error string.
        message: String,
    },
    /// Raised when no free loopback port can be allocated.
    #[error("failed to allocate a host port for SSH forwarding: {message}")]
    PortAllocation {
        /// Operating system error string.
        message: String,
    },
    /// Raised when the guest never becomes reachable over SSH.
    #[error("guest never became reachable: {source}")]
    Wait {
        /// Underlying SSH error.
        #[source]
        source: SshError,
    },
    /// Raised when a copy-in transfer fails.
    #[error("copy into guest failed: {source}")]
    CopyIn {
        /// Underlying SSH error.
        #[source]
        source: SshError,
    },
    /// Raised when a copy-out transfer fails.
    #[error("copy out of guest failed: {source}")]
    CopyOut {
        /// Underlying SSH error.
        #[source]
        source: SshError,
    },
    /// Raised when a shared folder cannot be mounted.
    #[error("shared folder mount failed: {source}")]
    SharedFolder {
        /// Underlying sshfs error.
        #[source]
        source: SshfsError,
    },
    /// Raised when the SSH console session cannot be established.
    #[error("SSH session failed: {source}")]
    Console {
        /// Underlying SSH error.
        #[source]
        source: SshError,
    },
}

/// Executes the VM run flow using the provided store and command runner.
#[derive(Debug)]
pub struct VmRunner<R: CommandRunner + Clone> {
    config: RunConfig,
    store: ImageStore<R>,
    runner: R,
}

impl<R: CommandRunner + Clone> VmRunner<R> {
    /// Creates a runner after validating the `[run]` configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::Config`] when validation fails.
    pub fn new(config: RunConfig, store: ImageStore<R>, runner: R) -> Result<Self, RunError> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            runner,
        })
    }

    /// Runs the end-to-end workflow and returns the process exit code: the
    /// SSH session's code in console modes, QEMU's otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`RunError`] when any stage fails. Once QEMU is running,
    /// failures kill it before returning so no VM outlives its error.
    pub async fn execute(&self, request: &RunRequest) -> Result<i32, RunError> {
        let images = self.prepare_images(request).await?;
        if request.prepare_only {
            info!(vm = %request.vm_name, "images prepared; not starting the VM");
            return Ok(0);
        }

        info!(vm = %request.vm_name, "finished preparation, starting virtual machine");

        let ssh_port = self.choose_ssh_port(request)?;
        let qemu_args = build_qemu_args(request, &images, ssh_port);
        let (quiet, silenceable) = output_mode(request);

        let mut qemu =
            QemuRunner::new(qemu_args, quiet, silenceable).with_bin(self.config.qemu_bin.clone());
        qemu.start()?;

        let Some(port) = ssh_port else {
            // Nothing needs the guest network: QEMU owns the terminal until
            // the guest powers down on its own.
            return Ok(qemu.wait(None).await?);
        };

        let ssh = SshClient::new(SshConfig::for_guest(&self.config, port), self.runner.clone());
        let session = self.guest_session(request, &ssh, &mut qemu).await;
        match session {
            Ok(code) => Ok(code),
            Err(err) => {
                qemu.kill().await.ok();
                Err(err)
            }
        }
    }

    async fn prepare_images(&self, request: &RunRequest) -> Result<Vec<ImageInfo>, RunError> {
        let mut images = Vec::with_capacity(request.images.len());
        for (index, spec) in request.images.iter().enumerate() {
            images.push(
                self.store
                    .create_vm_image(spec, &request.vm_name, index)
                    .await?,
            );
        }
        Ok(images)
    }

    fn choose_ssh_port(&self, request: &RunRequest) -> Result<Option<u16>, RunError> {
        if !request.needs_ssh() {
            return Ok(None);
        }
        match self.config.ssh_port {
            Some(port) => Ok(Some(port)),
            None => allocate_loopback_port().map(Some),
        }
    }

    async fn guest_session(
        &self,
        request: &RunRequest,
        ssh: &SshClient<R>,
        qemu: &mut QemuRunner,
    ) -> Result<i32, RunError> {
        ssh.wait_for_ready(self.config.ssh_timeout())
            .await
            .map_err(|source| RunError::Wait { source })?;

        for pair in &request.copy_in_before {
            ssh.copy_in(&pair.from, &pair.to, self.config.copy_timeout())
                .map_err(|source| RunError::CopyIn { source })?;
        }

        let mut mounts: Vec<SharedFolderMount> = Vec::with_capacity(request.shared_folders.len());
        for folder in &request.shared_folders {
            let mount = mount_shared_folder(
                ssh,
                &self.config.sftp_server_bin,
                folder,
                self.config.ssh_timeout(),
            )
            .await
            .map_err(|source| RunError::SharedFolder { source })?;
            mounts.push(mount);
        }

        if !request.needs_ssh_console() {
            // Headless run with copies or shared folders: QEMU decides when
            // the VM is done.
            let code = qemu.wait(None).await?;
            drop(mounts);
            return Ok(code);
        }

        // The guest is reachable; the serial console has served its purpose.
        qemu.silence()?;
        let code = ssh
            .connect_console(request.ssh_command.as_deref())
            .map_err(|source| RunError::Console { source })?;

        for pair in &request.copy_out_after {
            ssh.copy_out(&pair.from, &pair.to, self.config.copy_timeout())
                .map_err(|source| RunError::CopyOut { source })?;
        }

        self.shutdown_guest(ssh, qemu).await?;
        drop(mounts);
        Ok(code)
    }

    async fn shutdown_guest(
        &self,
        ssh: &SshClient<R>,
        qemu: &mut QemuRunner,
    ) -> Result<(), RunError> {
        match ssh.shutdown() {
            Ok(output) if !output.is_success() => {
                warn!(
                    status = ?output.code,
                    stderr = %output.stderr.trim(),
                    "guest shutdown command did not succeed"
                );
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "guest shutdown command failed"),
        }

        qemu.wait(Some(self.config.shutdown_timeout())).await?;
        Ok(())
    }

    #[cfg(test)]
    const fn store(&self) -> &ImageStore<R> {
        &self.store
    }
}

fn output_mode(request: &RunRequest) -> (bool, bool) {
    if !request.needs_ssh_console() {
        return (false, false);
    }
    if request.ssh_with_serial {
        (false, true)
    } else {
        (true, false)
    }
}

fn build_qemu_args(
    request: &RunRequest,
    images: &[ImageInfo],
    ssh_port: Option<u16>,
) -> Vec<String> {
    let mut args = Vec::new();
    for image in images {
        args.push(String::from("-drive"));
        args.push(format!("file={}", image.path));
    }

    if let Some(port) = ssh_port {
        if request.needs_ssh_console() {
            args.push(String::from("-nographic"));
        }
        args.push(String::from("-netdev"));
        args.push(format!(
            "user,id={SSH_NETDEV_ID},hostfwd=tcp::{port}-:{GUEST_SSH_PORT}"
        ));
        args.push(String::from("-device"));
        args.push(format!("e1000,netdev={SSH_NETDEV_ID}"));
    }

    args.extend(request.qemu_args.iter().cloned());
    args
}

/// Asks the kernel for a free loopback port by binding port zero.
///
/// The kernel avoids handing the port out again until it has to, so
/// releasing it immediately and giving it to QEMU's `hostfwd` is effectively
/// race-free.
fn allocate_loopback_port() -> Result<u16, RunError> {
    let port_error = |err: &dyn std::fmt::Display| RunError::PortAllocation {
        message: err.to_string(),
    };
    let listener = TcpListener::bind(("127.0.0.1", 0)).map_err(|err| port_error(&err))?;
    let addr = listener.local_addr().map_err(|err| port_error(&err))?;
    Ok(addr.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::image::ImageKind;
    use crate::test_support::ScriptedRunner;
    use rstest::rstest;
    use tempfile::TempDir;

    fn request() -> RunRequest {
        RunRequest {
            vm_name: String::from("testvm"),
            images: vec![String::from("alpine")],
            ..RunRequest::default()
        }
    }

    fn image_at(path: &str) -> ImageInfo {
        ImageInfo {
            name: String::from("alpine"),
            kind: ImageKind::Frontend,
            vm_name: Some(String::from("testvm")),
            path: Utf8PathBuf::from(path),
            size_bytes: 0,
        }
    }

    #[rstest]
    #[case::plain(RunRequest::default(), false, false)]
    #[case::console(
        RunRequest { ssh_console: true, ..RunRequest::default() },
        true,
        true
    )]
    #[case::serial(
        RunRequest { ssh_with_serial: true, ..RunRequest::default() },
        true,
        true
    )]
    #[case::command(
        RunRequest { ssh_command: Some(String::from("ls")), ..RunRequest::default() },
        true,
        true
    )]
    #[case::shared_folder(
        RunRequest {
            shared_folders: vec![SharedFolder {
                local: Utf8PathBuf::from("/src"),
                remote: String::from("/dst"),
            }],
            ..RunRequest::default()
        },
        true,
        false
    )]
    #[case::copy_in(
        RunRequest {
            copy_in_before: vec![CopyPair {
                from: String::from("a"),
                to: String::from("b"),
            }],
            ..RunRequest::default()
        },
        true,
        false
    )]
    fn ssh_requirements_follow_request_shape(
        #[case] request: RunRequest,
        #[case] needs_ssh: bool,
        #[case] needs_console: bool,
    ) {
        assert_eq!(request.needs_ssh(), needs_ssh);
        assert_eq!(request.needs_ssh_console(), needs_console);
    }

    #[test]
    fn qemu_args_for_plain_run_only_carry_drives() {
        let args = build_qemu_args(&request(), &[image_at("/store/testvm-0.qcow2")], None);
        assert_eq!(args, vec!["-drive", "file=/store/testvm-0.qcow2"]);
    }

    #[test]
    fn qemu_args_for_console_run_forward_ssh_and_drop_graphics() {
        let mut console_request = request();
        console_request.ssh_console = true;
        let args = build_qemu_args(
            &console_request,
            &[image_at("/store/testvm-0.qcow2")],
            Some(8022),
        );
        assert_eq!(
            args,
            vec![
                "-drive",
                "file=/store/testvm-0.qcow2",
                "-nographic",
                "-netdev",
                "user,id=transient-sshdev,hostfwd=tcp::8022-:22",
                "-device",
                "e1000,netdev=transient-sshdev",
            ]
        );
    }

    #[test]
    fn qemu_args_keep_user_arguments_last() {
        let mut with_extra = request();
        with_extra.qemu_args = vec![String::from("-m"), String::from("1G")];
        let args = build_qemu_args(&with_extra, &[image_at("/store/testvm-0.qcow2")], None);
        assert_eq!(
            args.iter().rev().take(2).rev().collect::<Vec<_>>(),
            vec!["-m", "1G"]
        );
    }

    #[rstest]
    #[case::headless(RunRequest::default(), false, false)]
    #[case::console(
        RunRequest { ssh_console: true, ..RunRequest::default() },
        true,
        false
    )]
    #[case::serial(
        RunRequest { ssh_with_serial: true, ..RunRequest::default() },
        false,
        true
    )]
    fn output_mode_matches_console_flags(
        #[case] request: RunRequest,
        #[case] quiet: bool,
        #[case] silenceable: bool,
    ) {
        assert_eq!(output_mode(&request), (quiet, silenceable));
    }

    #[test]
    fn path_specs_split_on_the_first_colon() {
        let pair =
            parse_copy_pair("./logs:/var/log/app").unwrap_or_else(|err| panic!("parse: {err}"));
        assert_eq!(pair.from, "./logs");
        assert_eq!(pair.to, "/var/log/app");
    }

    #[rstest]
    #[case("no-colon")]
    #[case(":remote-only")]
    #[case("local-only:")]
    fn malformed_path_specs_are_rejected(#[case] raw: &str) {
        let result = parse_copy_pair(raw);
        assert!(matches!(result, Err(RunError::InvalidPathSpec { .. })));
    }

    #[test]
    fn shared_folder_local_half_becomes_absolute() {
        let folder =
            parse_shared_folder("src:/mnt/src").unwrap_or_else(|err| panic!("parse: {err}"));
        assert!(folder.local.is_absolute(), "local: {}", folder.local);
        assert_eq!(folder.remote, "/mnt/src");
    }

    #[test]
    fn generated_vm_names_are_unique() {
        let first = generated_vm_name();
        let second = generated_vm_name();
        assert!(first.starts_with("transient-"));
        assert_ne!(first, second);
    }

    #[test]
    fn loopback_port_allocation_yields_nonzero_port() {
        let port = allocate_loopback_port().unwrap_or_else(|err| panic!("allocate: {err}"));
        assert_ne!(port, 0);
    }

    struct RunnerFixture {
        runner: VmRunner<ScriptedRunner>,
        script: ScriptedRunner,
        _tmp: TempDir,
    }

    fn runner_fixture(config: RunConfig) -> RunnerFixture {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
            .unwrap_or_else(|err| panic!("temp path should be utf8: {}", err.display()));
        let script = ScriptedRunner::new();
        let store = ImageStore::with_dirs(
            root.join("backend"),
            root.join("frontend"),
            StoreConfig::defaults().qemu_img_bin,
            script.clone(),
        )
        .unwrap_or_else(|err| panic!("open store: {err}"));
        let runner = VmRunner::new(config, store, script.clone())
            .unwrap_or_else(|err| panic!("build runner: {err}"));
        RunnerFixture {
            runner,
            script,
            _tmp: tmp,
        }
    }

    fn seed_backend(fixture: &RunnerFixture, name: &str) {
        let path = fixture
            .runner
            .store()
            .backend_dir()
            .join(format!("{name}.qcow2"));
        std::fs::write(path, b"qcow2-bytes").unwrap_or_else(|err| panic!("seed backend: {err}"));
    }

    #[tokio::test]
    async fn prepare_only_creates_images_without_booting() {
        let fixture = runner_fixture(RunConfig::defaults());
        seed_backend(&fixture, "alpine");
        fixture.script.push_success();

        let mut prepare_request = request();
        prepare_request.prepare_only = true;

        let code = fixture
            .runner
            .execute(&prepare_request)
            .await
            .unwrap_or_else(|err| panic!("execute: {err}"));

        assert_eq!(code, 0);
        // Only qemu-img ran; no ssh, no QEMU.
        let invocations = fixture.script.invocations();
        assert_eq!(invocations.len(), 1);
        assert_eq!(
            invocations.first().map(|call| call.program.clone()),
            Some(String::from("qemu-img"))
        );
    }

    #[tokio::test]
    async fn plain_run_returns_qemu_exit_code() {
        // `true` ignores the -drive arguments and exits zero, standing in for
        // a guest that powers itself down.
        let config = RunConfig {
            qemu_bin: String::from("true"),
            ..RunConfig::defaults()
        };
        let fixture = runner_fixture(config);
        seed_backend(&fixture, "alpine");
        fixture.script.push_success();

        let code = fixture
            .runner
            .execute(&request())
            .await
            .unwrap_or_else(|err| panic!("execute: {err}"));
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn failed_image_preparation_aborts_the_run() {
        let fixture = runner_fixture(RunConfig::defaults());

        let result = fixture.runner.execute(&request()).await;
        assert!(
            matches!(
                result,
                Err(RunError::Image(ImageStoreError::MissingBackend { .. }))
            ),
            "expected MissingBackend, got {result:?}"
        );
    }
}
