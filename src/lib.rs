//! Core library for the Transient VM launcher.
//!
//! The crate wraps QEMU to run short-lived virtual machines: a two-level
//! disk image store (pristine backends, per-VM copy-on-write frontends), a
//! supervised QEMU child with filtered serial output, and SSH plumbing for
//! consoles, file copies, and sshfs shared folders.

pub mod config;
pub mod image;
pub mod process;
pub mod qemu;
pub mod run;
pub mod ssh;
pub mod sshfs;
pub mod test_support;

pub use config::{ConfigError, RunConfig, RunOverrides, StoreConfig};
pub use image::{
    ImageInfo, ImageKind, ImageSpec, ImageStore, ImageStoreError, decode_backend_file_name,
    encode_backend_file_name,
};
pub use process::{CommandOutput, CommandRunner, ProcessCommandRunner, SpawnError};
pub use qemu::{QemuError, QemuRunner};
pub use run::{
    CopyPair, RunError, RunRequest, VmRunner, generated_vm_name, parse_copy_pair,
    parse_shared_folder,
};
pub use ssh::{SshClient, SshConfig, SshError};
pub use sshfs::{SharedFolder, SharedFolderMount, SshfsError};
