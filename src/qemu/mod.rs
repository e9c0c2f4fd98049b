//! QEMU process supervision.
//!
//! The QEMU child is the one long-lived process `transient` manages
//! directly. Three output modes exist: unredirected (the serial console owns
//! the terminal), quiet (all guest output discarded), and proxied (guest
//! output is forwarded to the terminal only once the Linux kernel starts
//! logging, and can be silenced once an SSH session takes over the screen).

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::bytes::Regex;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info};

/// Default QEMU system emulator binary.
pub const DEFAULT_QEMU_BIN: &str = "qemu-system-x86_64";

// Exit code reported when the child had to be killed (128 + SIGKILL, the
// shell convention).
const EXIT_KILLED: i32 = 137;

/// Kernel log timestamp, e.g. `[    0.000000]`. Everything before the first
/// match is bootloader noise (ANSI art, menus) that would trash the host
/// terminal.
static BOOT_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    #[expect(clippy::expect_used, reason = "pattern is a compile-time constant")]
    let marker = Regex::new(r"\[[ 0-9]+\.[0-9]+\]").expect("boot marker pattern is valid");
    marker
});

/// Errors raised while supervising the QEMU child.
#[derive(Debug, Error)]
pub enum QemuError {
    /// Raised when the QEMU process cannot be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Binary that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when an operation requires a started child.
    #[error("QEMU process has not been started")]
    NotStarted,
    /// Raised when silencing a runner that is neither quiet nor proxied.
    #[error("QEMU output is not silenceable in this mode")]
    NotSilenceable,
    /// Raised when waiting on the child fails at the OS level.
    #[error("failed to wait for QEMU: {message}")]
    Wait {
        /// Operating system error string.
        message: String,
    },
}

/// Buffers child output until the kernel boot marker appears, then passes
/// everything through.
#[derive(Debug, Default)]
struct BootGate {
    started: bool,
    buffer: Vec<u8>,
}

impl BootGate {
    /// Feeds a chunk of child output, returning the bytes that should reach
    /// the terminal.
    fn feed(&mut self, chunk: &[u8]) -> Option<Vec<u8>> {
        if self.started {
            return Some(chunk.to_vec());
        }

        self.buffer.extend_from_slice(chunk);
        let position = BOOT_MARKER.find(&self.buffer)?.start();
        self.started = true;
        let visible = self.buffer.split_off(position);
        self.buffer = Vec::new();
        Some(visible)
    }
}

/// Forwards proxied QEMU output to the terminal until silenced.
#[derive(Debug, Default)]
struct OutputProxy {
    quiet: AtomicBool,
}

impl OutputProxy {
    fn silence(&self) {
        self.quiet.store(true, Ordering::SeqCst);
    }

    fn is_silenced(&self) -> bool {
        self.quiet.load(Ordering::SeqCst)
    }

    async fn pump(self: Arc<Self>, mut stdout: ChildStdout) {
        let mut gate = BootGate::default();
        let mut chunk = vec![0_u8; 4096];
        let mut terminal = tokio::io::stdout();

        loop {
            let read = match stdout.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if self.is_silenced() {
                break;
            }
            let Some(received) = chunk.get(..read) else {
                break;
            };
            if let Some(visible) = gate.feed(received) {
                if terminal.write_all(&visible).await.is_err() {
                    break;
                }
                terminal.flush().await.ok();
            }
        }
        debug!("QEMU output proxy finished");
    }
}

/// Supervises a single QEMU child process.
#[derive(Debug)]
pub struct QemuRunner {
    bin_name: String,
    args: Vec<String>,
    quiet: bool,
    proxy: Option<Arc<OutputProxy>>,
    child: Option<Child>,
}

impl QemuRunner {
    /// Creates a runner for the given argument vector.
    ///
    /// `quiet` discards all guest output; `silenceable` proxies it through
    /// the boot gate so it can be silenced later. The two are mutually
    /// exclusive by construction in the orchestrator: `quiet` wins.
    #[must_use]
    pub fn new(args: Vec<String>, quiet: bool, silenceable: bool) -> Self {
        let proxy = (!quiet && silenceable).then(|| Arc::new(OutputProxy::default()));
        Self {
            bin_name: DEFAULT_QEMU_BIN.to_owned(),
            args,
            quiet,
            proxy,
            child: None,
        }
    }

    /// Overrides the QEMU binary name.
    #[must_use]
    pub fn with_bin(mut self, bin_name: impl Into<String>) -> Self {
        self.bin_name = bin_name.into();
        self
    }

    /// Spawns the QEMU child process.
    ///
    /// The child is configured to be killed when the runner is dropped, so a
    /// panicking or interrupted run does not leave a stray VM behind.
    ///
    /// # Errors
    ///
    /// Returns [`QemuError::Spawn`] when the binary cannot be started.
    pub fn start(&mut self) -> Result<(), QemuError> {
        info!(bin = %self.bin_name, args = ?self.args, "starting QEMU process");

        let mut command = Command::new(&self.bin_name);
        command.args(&self.args).kill_on_drop(true);

        if self.quiet {
            command.stdin(Stdio::null()).stdout(Stdio::null());
        } else if self.proxy.is_some() {
            command.stdin(Stdio::null()).stdout(Stdio::piped());
        }

        let mut child = command.spawn().map_err(|err| QemuError::Spawn {
            program: self.bin_name.clone(),
            message: err.to_string(),
        })?;

        if let Some(proxy) = &self.proxy {
            if let Some(stdout) = child.stdout.take() {
                tokio::spawn(Arc::clone(proxy).pump(stdout));
            }
        }

        self.child = Some(child);
        Ok(())
    }

    /// Stops forwarding proxied guest output to the terminal.
    ///
    /// A quiet runner has nothing to silence and the call is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`QemuError::NotSilenceable`] when output is neither quiet nor
    /// proxied.
    pub fn silence(&self) -> Result<(), QemuError> {
        if self.quiet {
            return Ok(());
        }
        let proxy = self.proxy.as_ref().ok_or(QemuError::NotSilenceable)?;
        proxy.silence();
        Ok(())
    }

    /// Waits for the child to exit, killing it when `timeout` elapses.
    ///
    /// Returns the child's exit code, or 137 when it had to be killed.
    ///
    /// # Errors
    ///
    /// Returns [`QemuError::NotStarted`] before [`QemuRunner::start`] and
    /// [`QemuError::Wait`] when the OS-level wait fails.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> Result<i32, QemuError> {
        let child = self.child.as_mut().ok_or(QemuError::NotStarted)?;

        let status = match timeout {
            None => child.wait().await.map_err(|err| QemuError::Wait {
                message: err.to_string(),
            })?,
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(waited) => waited.map_err(|err| QemuError::Wait {
                    message: err.to_string(),
                })?,
                Err(_elapsed) => {
                    info!(
                        timeout_secs = limit.as_secs(),
                        "QEMU did not exit in time; killing it"
                    );
                    child.kill().await.map_err(|err| QemuError::Wait {
                        message: err.to_string(),
                    })?;
                    child.wait().await.map_err(|err| QemuError::Wait {
                        message: err.to_string(),
                    })?
                }
            },
        };

        Ok(status.code().map_or(EXIT_KILLED, |code| code))
    }

    /// Kills the child immediately.
    ///
    /// # Errors
    ///
    /// Returns [`QemuError::NotStarted`] before [`QemuRunner::start`] and
    /// [`QemuError::Wait`] when the kill fails.
    pub async fn kill(&mut self) -> Result<(), QemuError> {
        let child = self.child.as_mut().ok_or(QemuError::NotStarted)?;
        child.kill().await.map_err(|err| QemuError::Wait {
            message: err.to_string(),
        })
    }
}
