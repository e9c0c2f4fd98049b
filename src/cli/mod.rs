//! Command-line interface definitions for the `transient` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `transient` binary.
#[derive(Debug, Parser)]
#[command(
    name = "transient",
    about = "Launch short-lived QEMU virtual machines reachable over SSH",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Prepare disk images and launch a virtual machine.
    #[command(name = "run", about = "Prepare disk images and launch a virtual machine")]
    Run(RunCli),
    /// List images in the backend and frontend stores.
    #[command(name = "list", about = "List images in the backend and frontend stores")]
    List(ListCli),
    /// Delete images from the backend and frontend stores.
    #[command(name = "delete", about = "Delete images from the backend and frontend stores")]
    Delete(DeleteCli),
}

/// Arguments for the `transient run` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct RunCli {
    /// Name for the virtual machine; autogenerated when omitted.
    #[arg(long, value_name = "NAME")]
    pub(crate) name: Option<String>,
    /// Disk image spec, either `NAME` or `NAME=URL`. Repeatable; the first
    /// image becomes the boot disk.
    #[arg(long, value_name = "SPEC", required = true)]
    pub(crate) image: Vec<String>,
    /// Download and create disk images, then exit without starting QEMU.
    #[arg(long)]
    pub(crate) prepare_only: bool,
    /// Connect the terminal to the guest over SSH instead of the serial
    /// console.
    #[arg(long)]
    pub(crate) ssh_console: bool,
    /// Like --ssh-console, but keep forwarding serial output until the SSH
    /// session is established.
    #[arg(long)]
    pub(crate) ssh_with_serial: bool,
    /// Run a single command in the guest over SSH instead of an interactive
    /// session.
    #[arg(long, value_name = "CMD")]
    pub(crate) ssh_command: Option<String>,
    /// Remote user for SSH connections.
    #[arg(long, value_name = "USER")]
    pub(crate) ssh_user: Option<String>,
    /// Host port forwarded to guest port 22; a random free port when unset.
    #[arg(long, value_name = "PORT")]
    pub(crate) ssh_port: Option<u16>,
    /// Seconds to wait for the guest SSH endpoint to become reachable.
    #[arg(long, value_name = "SECS")]
    pub(crate) ssh_timeout: Option<u64>,
    /// Seconds to wait for QEMU to exit after requesting guest shutdown.
    #[arg(long, value_name = "SECS")]
    pub(crate) shutdown_timeout: Option<u64>,
    /// Seconds allowed for each --copy-in-before / --copy-out-after transfer.
    #[arg(long, value_name = "SECS")]
    pub(crate) copy_timeout: Option<u64>,
    /// Mount a host directory in the guest, as `LOCAL:REMOTE`. Repeatable.
    #[arg(long, value_name = "LOCAL:REMOTE")]
    pub(crate) shared_folder: Vec<String>,
    /// Copy a host path into the guest before connecting, as `LOCAL:REMOTE`.
    /// Repeatable.
    #[arg(long, value_name = "LOCAL:REMOTE")]
    pub(crate) copy_in_before: Vec<String>,
    /// Copy a guest path back to the host after the session ends, as
    /// `REMOTE:LOCAL`. Repeatable.
    #[arg(long, value_name = "REMOTE:LOCAL")]
    pub(crate) copy_out_after: Vec<String>,
    /// Additional arguments passed to QEMU verbatim (after `--`).
    #[arg(last = true, value_name = "QEMU_ARG")]
    pub(crate) qemu_args: Vec<String>,
}

/// Arguments for the `transient list` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct ListCli {
    /// Only list frontend images belonging to this virtual machine.
    #[arg(long, value_name = "NAME")]
    pub(crate) name: Option<String>,
    /// Only list images created from this image name.
    #[arg(long, value_name = "IMAGE")]
    pub(crate) image: Option<String>,
}

/// Arguments for the `transient delete` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct DeleteCli {
    /// Delete the frontend images belonging to this virtual machine.
    #[arg(long, value_name = "NAME")]
    pub(crate) name: Option<String>,
    /// Delete images created from this image name.
    #[arg(long, value_name = "IMAGE")]
    pub(crate) image: Option<String>,
    /// Also delete matching backend images, which other virtual machines may
    /// still reference.
    #[arg(long)]
    pub(crate) force: bool,
}
