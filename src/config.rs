//! Configuration loading via `ortho-config`.
//!
//! Two configuration sections are layered from defaults, `transient.toml`,
//! environment variables, and CLI flags in increasing order of precedence:
//! `[run]` for QEMU/SSH settings and `[store]` for the image store.

use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Default remote user baked into most cloud and vagrant images.
pub const DEFAULT_SSH_USER: &str = "vagrant";

/// Default seconds to wait for the guest SSH endpoint.
pub const DEFAULT_SSH_TIMEOUT_SECS: u64 = 90;

/// Default seconds to wait for QEMU to exit after a guest shutdown request.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 20;

/// Default seconds allowed for a single copy-in/copy-out transfer.
pub const DEFAULT_COPY_TIMEOUT_SECS: u64 = 30;

/// QEMU and SSH settings for `transient run`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "TRANSIENT_RUN",
    discovery(
        app_name = "transient",
        env_var = "TRANSIENT_CONFIG_PATH",
        config_file_name = "transient.toml",
        dotfile_name = ".transient.toml",
        project_file_name = "transient.toml"
    )
)]
pub struct RunConfig {
    /// Path to the QEMU system emulator executable.
    #[ortho_config(default = "qemu-system-x86_64".to_owned())]
    pub qemu_bin: String,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `scp` executable used for copy-in/copy-out.
    #[ortho_config(default = "scp".to_owned())]
    pub scp_bin: String,
    /// Path to the OpenSSH `sftp-server` binary serving shared folders.
    #[ortho_config(default = "/usr/lib/openssh/sftp-server".to_owned())]
    pub sftp_server_bin: String,
    /// Remote user to connect as.
    #[ortho_config(default = DEFAULT_SSH_USER.to_owned())]
    pub ssh_user: String,
    /// Host port forwarded to guest port 22. A random free port is allocated
    /// when unset.
    pub ssh_port: Option<u16>,
    /// Seconds to wait for the guest SSH endpoint to become reachable.
    #[ortho_config(default = DEFAULT_SSH_TIMEOUT_SECS)]
    pub ssh_timeout_secs: u64,
    /// Seconds to wait for QEMU to exit after requesting guest shutdown.
    #[ortho_config(default = DEFAULT_SHUTDOWN_TIMEOUT_SECS)]
    pub shutdown_timeout_secs: u64,
    /// Seconds allowed for each copy-in/copy-out transfer.
    #[ortho_config(default = DEFAULT_COPY_TIMEOUT_SECS)]
    pub copy_timeout_secs: u64,
    /// Path to the SSH private key for guest authentication. Supports tilde
    /// expansion (`~/.ssh/id_ed25519`). Optional; when not provided, SSH
    /// falls back to default key locations. Validation rejects empty or
    /// whitespace-only values.
    pub ssh_identity_file: Option<String>,
}

impl RunConfig {
    /// Returns the built-in defaults, the lowest layer of the configuration
    /// stack.
    #[must_use]
    pub fn defaults() -> Self {
        Self {
            qemu_bin: String::from("qemu-system-x86_64"),
            ssh_bin: String::from("ssh"),
            scp_bin: String::from("scp"),
            sftp_server_bin: String::from("/usr/lib/openssh/sftp-server"),
            ssh_user: DEFAULT_SSH_USER.to_owned(),
            ssh_port: None,
            ssh_timeout_secs: DEFAULT_SSH_TIMEOUT_SECS,
            shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            copy_timeout_secs: DEFAULT_COPY_TIMEOUT_SECS,
            ssh_identity_file: None,
        }
    }
}

/// CLI-sourced overrides applied on top of the layered `[run]` settings.
///
/// Unset fields leave the layered value untouched, matching the precedence
/// order of the rest of the configuration stack.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RunOverrides {
    /// Remote user override.
    pub ssh_user: Option<String>,
    /// Forwarded host port override.
    pub ssh_port: Option<u16>,
    /// SSH readiness timeout override, in seconds.
    pub ssh_timeout_secs: Option<u64>,
    /// Shutdown timeout override, in seconds.
    pub shutdown_timeout_secs: Option<u64>,
    /// Copy timeout override, in seconds.
    pub copy_timeout_secs: Option<u64>,
}

impl RunConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("transient")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Applies CLI overrides, which take precedence over every other layer.
    #[must_use]
    pub fn merge_overrides(mut self, overrides: RunOverrides) -> Self {
        if let Some(user) = overrides.ssh_user {
            self.ssh_user = user;
        }
        if let Some(port) = overrides.ssh_port {
            self.ssh_port = Some(port);
        }
        if let Some(secs) = overrides.ssh_timeout_secs {
            self.ssh_timeout_secs = secs;
        }
        if let Some(secs) = overrides.shutdown_timeout_secs {
            self.shutdown_timeout_secs = secs;
        }
        if let Some(secs) = overrides.copy_timeout_secs {
            self.copy_timeout_secs = secs;
        }
        self
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty
    /// after trimming.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_value("run", &self.qemu_bin, "qemu_bin")?;
        require_value("run", &self.ssh_bin, "ssh_bin")?;
        require_value("run", &self.scp_bin, "scp_bin")?;
        require_value("run", &self.sftp_server_bin, "sftp_server_bin")?;
        require_value("run", &self.ssh_user, "ssh_user")?;
        require_optional_value("run", self.ssh_identity_file.as_deref(), "ssh_identity_file")?;
        Ok(())
    }

    /// SSH readiness timeout as a [`Duration`].
    #[must_use]
    pub const fn ssh_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_timeout_secs)
    }

    /// Shutdown timeout as a [`Duration`].
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Copy timeout as a [`Duration`].
    #[must_use]
    pub const fn copy_timeout(&self) -> Duration {
        Duration::from_secs(self.copy_timeout_secs)
    }
}

/// Image store locations and tooling for every subcommand.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "TRANSIENT_STORE",
    discovery(
        app_name = "transient",
        env_var = "TRANSIENT_CONFIG_PATH",
        config_file_name = "transient.toml",
        dotfile_name = ".transient.toml",
        project_file_name = "transient.toml"
    )
)]
pub struct StoreConfig {
    /// Directory holding pristine backend images.
    #[ortho_config(default = "~/.local/share/transient/backend".to_owned())]
    pub backend_dir: String,
    /// Directory holding per-VM frontend images.
    #[ortho_config(default = "~/.local/share/transient/frontend".to_owned())]
    pub frontend_dir: String,
    /// Path to the `qemu-img` executable used to create overlay images.
    #[ortho_config(default = "qemu-img".to_owned())]
    pub qemu_img_bin: String,
}

impl StoreConfig {
    /// Returns the built-in defaults, the lowest layer of the configuration
    /// stack.
    #[must_use]
    pub fn defaults() -> Self {
        Self {
            backend_dir: String::from("~/.local/share/transient/backend"),
            frontend_dir: String::from("~/.local/share/transient/frontend"),
            qemu_img_bin: String::from("qemu-img"),
        }
    }
}

impl StoreConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("transient")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty
    /// after trimming.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_value("store", &self.backend_dir, "backend_dir")?;
        require_value("store", &self.frontend_dir, "frontend_dir")?;
        require_value("store", &self.qemu_img_bin, "qemu_img_bin")?;
        Ok(())
    }

    /// Backend directory with tilde expansion applied.
    #[must_use]
    pub fn backend_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(expand_tilde(&self.backend_dir))
    }

    /// Frontend directory with tilde expansion applied.
    #[must_use]
    pub fn frontend_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(expand_tilde(&self.frontend_dir))
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing. The
    /// message names the environment variable and TOML key that supply it.
    #[error(
        "missing {field}: set TRANSIENT_{section_env}_{field_env} or add {field} to [{section}] in transient.toml",
        section_env = section.to_uppercase(),
        field_env = field.to_uppercase()
    )]
    MissingField {
        /// Configuration section the field belongs to.
        section: String,
        /// Configuration field that failed validation.
        field: String,
    },
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

/// Expands a leading `~/` prefix to the user's home directory.
///
/// If the `HOME` environment variable is not set, the function returns the
/// input string unchanged (i.e., the leading `~` is not expanded).
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

fn require_value(section: &str, value: &str, field: &str) -> Result<(), ConfigError> {
    require_optional_value(section, Some(value), field)
}

fn require_optional_value(
    section: &str,
    value: Option<&str>,
    field: &str,
) -> Result<(), ConfigError> {
    match value {
        None => Ok(()),
        Some(v) if !v.trim().is_empty() => Ok(()),
        Some(_) => Err(ConfigError::MissingField {
            section: section.to_owned(),
            field: field.to_owned(),
        }),
    }
}
