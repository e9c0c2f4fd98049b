//! The local disk-image store.
//!
//! Images live in two directories: **backend** images are pristine base
//! disks, downloaded once and never booted; **frontend** images are per-VM
//! qcow2 overlays created on top of a backend image with `qemu-img`. Each
//! frontend image carries a JSON manifest sidecar recording which VM owns it
//! and which image it was created from, so listing never has to guess at
//! filename conventions.

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::process::{CommandRunner, SpawnError};

mod download;
mod spec;

pub use spec::{ImageSpec, decode_backend_file_name, encode_backend_file_name};

const MANIFEST_EXTENSION: &str = "json";
const FRONTEND_EXTENSION: &str = "qcow2";

/// Which half of the store an image belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ImageKind {
    /// Pristine base image shared by any number of VMs.
    Backend,
    /// Per-VM copy-on-write overlay.
    Frontend,
}

/// A single image known to the store.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageInfo {
    /// Image name the file was created from.
    pub name: String,
    /// Store half the file lives in.
    pub kind: ImageKind,
    /// Owning VM name, for frontend images.
    pub vm_name: Option<String>,
    /// Absolute path to the disk file.
    pub path: Utf8PathBuf,
    /// File size in bytes.
    pub size_bytes: u64,
}

/// Sidecar metadata written next to each frontend image.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
struct FrontendManifest {
    vm_name: String,
    image: String,
}

/// Errors raised by the image store.
#[derive(Debug, Error)]
pub enum ImageStoreError {
    /// Raised when an `--image` argument cannot be parsed.
    #[error("invalid image spec {spec:?}: {reason}")]
    InvalidSpec {
        /// The raw spec as given on the command line.
        spec: String,
        /// Why it was rejected.
        reason: String,
    },
    /// Raised when a spec names a backend image that is not present and
    /// provides no URL to fetch it from.
    #[error("backend image {name:?} not found in {dir} and no URL was provided")]
    MissingBackend {
        /// Image name that was looked up.
        name: String,
        /// Backend directory that was consulted.
        dir: Utf8PathBuf,
    },
    /// Raised when downloading a backend image fails.
    #[error("failed to download {url}: {message}")]
    Download {
        /// Source URL.
        url: String,
        /// Transport or HTTP error string.
        message: String,
    },
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when a frontend manifest cannot be parsed.
    #[error("failed to parse manifest {path}: {message}")]
    Manifest {
        /// Manifest path that could not be parsed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when a frontend image already exists but was created from a
    /// different backend image.
    #[error("frontend image {path} already exists but was created from {existing:?}, not {requested:?}")]
    FrontendConflict {
        /// Conflicting frontend image path.
        path: Utf8PathBuf,
        /// Image name recorded in the existing manifest.
        existing: String,
        /// Image name requested now.
        requested: String,
    },
    /// Raised when `qemu-img` exits with a non-zero status.
    #[error("{program} exited with status {status_text}: {stderr}")]
    CreateImage {
        /// Program that was invoked.
        program: String,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the process.
        stderr: String,
    },
    /// Raised when a helper process cannot be started.
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    /// Raised when `delete` is called with neither a name nor an image.
    #[error("nothing selected: pass --name and/or --image to delete")]
    NothingSelected,
    /// Raised when delete filters match no images.
    #[error("no images matched the given filters")]
    NoMatches,
    /// Raised when deleting a backend image without `--force`.
    #[error("backend image {name:?} may be referenced by other VM images; rerun with --force to delete it")]
    BackendRequiresForce {
        /// Backend image name that matched.
        name: String,
    },
}

/// The backend/frontend image store.
#[derive(Debug)]
pub struct ImageStore<R: CommandRunner> {
    backend_dir: Utf8PathBuf,
    frontend_dir: Utf8PathBuf,
    qemu_img_bin: String,
    runner: R,
}

impl<R: CommandRunner> ImageStore<R> {
    /// Opens the store described by `config`, creating its directories when
    /// absent.
    ///
    /// # Errors
    ///
    /// Returns [`ImageStoreError::Io`] when a store directory cannot be
    /// created.
    pub fn open(config: &StoreConfig, runner: R) -> Result<Self, ImageStoreError> {
        Self::with_dirs(
            config.backend_path(),
            config.frontend_path(),
            config.qemu_img_bin.clone(),
            runner,
        )
    }

    /// Opens a store rooted at explicit directories.
    ///
    /// # Errors
    ///
    /// Returns [`ImageStoreError::Io`] when a store directory cannot be
    /// created.
    pub fn with_dirs(
        backend_dir: Utf8PathBuf,
        frontend_dir: Utf8PathBuf,
        qemu_img_bin: String,
        runner: R,
    ) -> Result<Self, ImageStoreError> {
        ensure_dir(&backend_dir)?;
        ensure_dir(&frontend_dir)?;
        Ok(Self {
            backend_dir,
            frontend_dir,
            qemu_img_bin,
            runner,
        })
    }

    /// Backend directory this store reads base images from.
    #[must_use]
    pub fn backend_dir(&self) -> &Utf8Path {
        &self.backend_dir
    }

    /// Frontend directory this store writes VM overlays to.
    #[must_use]
    pub fn frontend_dir(&self) -> &Utf8Path {
        &self.frontend_dir
    }

    /// Prepares the disk image for one `--image` spec of a VM.
    ///
    /// Ensures the backend image exists (downloading it when the spec carries
    /// a URL), then creates the `{vm_name}-{index}.qcow2` overlay and its
    /// manifest. An existing overlay for the same VM, index, and image is
    /// reused untouched.
    ///
    /// # Errors
    ///
    /// Returns [`ImageStoreError`] when the spec is invalid, the backend
    /// image is missing and cannot be fetched, or `qemu-img` fails.
    pub async fn create_vm_image(
        &self,
        raw_spec: &str,
        vm_name: &str,
        index: usize,
    ) -> Result<ImageInfo, ImageStoreError> {
        let parsed = ImageSpec::parse(raw_spec)?;
        let backend_path = self.ensure_backend(&parsed).await?;

        let stem = format!("{vm_name}-{index}");
        let frontend_path = self
            .frontend_dir
            .join(format!("{stem}.{FRONTEND_EXTENSION}"));
        let manifest_path = self.frontend_dir.join(format!("{stem}.{MANIFEST_EXTENSION}"));

        if path_exists(&frontend_path)? {
            let manifest = self.read_manifest(&manifest_path)?;
            if manifest.image != parsed.name {
                return Err(ImageStoreError::FrontendConflict {
                    path: frontend_path,
                    existing: manifest.image,
                    requested: parsed.name,
                });
            }
            debug!(path = %frontend_path, "reusing existing frontend image");
            return Ok(self.frontend_info(&manifest, &frontend_path));
        }

        self.create_overlay(&backend_path, &frontend_path)?;
        let manifest = FrontendManifest {
            vm_name: vm_name.to_owned(),
            image: parsed.name.clone(),
        };
        self.write_manifest(&manifest_path, &manifest)?;
        info!(image = %parsed.name, path = %frontend_path, "created frontend image");

        Ok(self.frontend_info(&manifest, &frontend_path))
    }

    /// Lists store contents, optionally filtered by VM name and image name.
    ///
    /// Frontend images are listed first, ordered by VM name; backend images
    /// follow, ordered by image name. A VM name filter excludes backend
    /// images, which belong to no VM.
    ///
    /// # Errors
    ///
    /// Returns [`ImageStoreError::Io`] when a store directory cannot be read
    /// and [`ImageStoreError::Manifest`] for undecodable manifests.
    pub fn list(
        &self,
        vm_name: Option<&str>,
        image: Option<&str>,
    ) -> Result<Vec<ImageInfo>, ImageStoreError> {
        let mut images = self.list_frontends(vm_name, image)?;
        if vm_name.is_none() {
            images.extend(self.list_backends(image)?);
        }
        Ok(images)
    }

    /// Deletes images matching the filters.
    ///
    /// Frontend images matching the VM name and/or image name are always
    /// deleted together with their manifests. Backend images match only the
    /// image name filter and require `force`, since other VMs' overlays may
    /// reference them. Returns the paths removed.
    ///
    /// # Errors
    ///
    /// Returns [`ImageStoreError::NothingSelected`] when both filters are
    /// unset, [`ImageStoreError::NoMatches`] when nothing matched, and
    /// [`ImageStoreError::BackendRequiresForce`] when a backend image matched
    /// without `force`.
    pub fn delete(
        &self,
        vm_name: Option<&str>,
        image: Option<&str>,
        force: bool,
    ) -> Result<Vec<Utf8PathBuf>, ImageStoreError> {
        if vm_name.is_none() && image.is_none() {
            return Err(ImageStoreError::NothingSelected);
        }

        // Refuse the whole request up front rather than deleting half of it.
        let backends = if vm_name.is_none() {
            self.list_backends(image)?
        } else {
            Vec::new()
        };
        if let Some(backend) = backends.first()
            && !force
        {
            return Err(ImageStoreError::BackendRequiresForce {
                name: backend.name.clone(),
            });
        }

        let mut removed = Vec::new();
        for info in self.list_frontends(vm_name, image)? {
            remove_file(&info.path)?;
            let manifest_path = info.path.with_extension(MANIFEST_EXTENSION);
            if path_exists(&manifest_path)? {
                remove_file(&manifest_path)?;
            }
            info!(path = %info.path, "deleted frontend image");
            removed.push(info.path);
        }

        for info in backends {
            remove_file(&info.path)?;
            info!(path = %info.path, "deleted backend image");
            removed.push(info.path);
        }

        if removed.is_empty() {
            return Err(ImageStoreError::NoMatches);
        }
        Ok(removed)
    }

    async fn ensure_backend(&self, parsed: &ImageSpec) -> Result<Utf8PathBuf, ImageStoreError> {
        let backend_path = self.backend_dir.join(parsed.backend_file_name());
        if path_exists(&backend_path)? {
            return Ok(backend_path);
        }

        let Some(url) = &parsed.url else {
            return Err(ImageStoreError::MissingBackend {
                name: parsed.name.clone(),
                dir: self.backend_dir.clone(),
            });
        };

        download::fetch_to_file(url, &backend_path).await?;
        Ok(backend_path)
    }

    fn create_overlay(
        &self,
        backend_path: &Utf8Path,
        frontend_path: &Utf8Path,
    ) -> Result<(), ImageStoreError> {
        let args = [
            std::ffi::OsString::from("create"),
            std::ffi::OsString::from("-f"),
            std::ffi::OsString::from(FRONTEND_EXTENSION),
            std::ffi::OsString::from("-b"),
            std::ffi::OsString::from(backend_path),
            std::ffi::OsString::from("-F"),
            std::ffi::OsString::from(FRONTEND_EXTENSION),
            std::ffi::OsString::from(frontend_path),
        ];

        let output = self.runner.run(&self.qemu_img_bin, &args)?;
        if output.is_success() {
            return Ok(());
        }

        let status_text = output
            .code
            .map_or_else(|| String::from("unknown"), |code| code.to_string());
        Err(ImageStoreError::CreateImage {
            program: self.qemu_img_bin.clone(),
            status_text,
            stderr: output.stderr,
        })
    }

    fn list_frontends(
        &self,
        vm_name: Option<&str>,
        image: Option<&str>,
    ) -> Result<Vec<ImageInfo>, ImageStoreError> {
        let mut images = Vec::new();
        for file_name in dir_file_names(&self.frontend_dir)? {
            let Some(stem) = file_name.strip_suffix(&format!(".{MANIFEST_EXTENSION}")) else {
                continue;
            };
            let manifest_path = self.frontend_dir.join(&file_name);
            let manifest = self.read_manifest(&manifest_path)?;

            if vm_name.is_some_and(|filter| filter != manifest.vm_name) {
                continue;
            }
            if image.is_some_and(|filter| filter != manifest.image) {
                continue;
            }

            let disk_path = self
                .frontend_dir
                .join(format!("{stem}.{FRONTEND_EXTENSION}"));
            if !path_exists(&disk_path)? {
                // Orphaned manifest; skip rather than invent a zero-byte image.
                continue;
            }
            images.push(self.frontend_info(&manifest, &disk_path));
        }
        images.sort_by(|lhs, rhs| {
            (lhs.vm_name.as_deref(), lhs.path.as_str())
                .cmp(&(rhs.vm_name.as_deref(), rhs.path.as_str()))
        });
        Ok(images)
    }

    fn list_backends(&self, image: Option<&str>) -> Result<Vec<ImageInfo>, ImageStoreError> {
        let mut images = Vec::new();
        for file_name in dir_file_names(&self.backend_dir)? {
            let Some(name) = decode_backend_file_name(&file_name) else {
                continue;
            };
            if image.is_some_and(|filter| filter != name) {
                continue;
            }
            let path = self.backend_dir.join(&file_name);
            let size_bytes = file_size(&path)?;
            images.push(ImageInfo {
                name,
                kind: ImageKind::Backend,
                vm_name: None,
                path,
                size_bytes,
            });
        }
        images.sort_by(|lhs, rhs| lhs.name.cmp(&rhs.name));
        Ok(images)
    }

    fn frontend_info(&self, manifest: &FrontendManifest, disk_path: &Utf8Path) -> ImageInfo {
        // Size is informational; a freshly created overlay may still be
        // materialising when we report it.
        let size_bytes = std::fs::metadata(disk_path)
            .map(|meta| meta.len())
            .unwrap_or(0);
        ImageInfo {
            name: manifest.image.clone(),
            kind: ImageKind::Frontend,
            vm_name: Some(manifest.vm_name.clone()),
            path: disk_path.to_path_buf(),
            size_bytes,
        }
    }

    fn read_manifest(&self, path: &Utf8Path) -> Result<FrontendManifest, ImageStoreError> {
        let dir = open_dir(&self.frontend_dir)?;
        let file_name = require_file_name(path)?;
        let contents = dir
            .read_to_string(file_name)
            .map_err(|err| ImageStoreError::Io {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
        serde_json::from_str(&contents).map_err(|err| ImageStoreError::Manifest {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }

    fn write_manifest(
        &self,
        path: &Utf8Path,
        manifest: &FrontendManifest,
    ) -> Result<(), ImageStoreError> {
        let dir = open_dir(&self.frontend_dir)?;
        let file_name = require_file_name(path)?;
        let rendered =
            serde_json::to_string_pretty(manifest).map_err(|err| ImageStoreError::Manifest {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
        dir.write(file_name, rendered)
            .map_err(|err| ImageStoreError::Io {
                path: path.to_path_buf(),
                message: err.to_string(),
            })
    }
}

fn ensure_dir(path: &Utf8Path) -> Result<(), ImageStoreError> {
    Dir::create_ambient_dir_all(path, ambient_authority()).map_err(|err| ImageStoreError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

fn open_dir(path: &Utf8Path) -> Result<Dir, ImageStoreError> {
    Dir::open_ambient_dir(path, ambient_authority()).map_err(|err| ImageStoreError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

fn require_file_name(path: &Utf8Path) -> Result<&str, ImageStoreError> {
    path.file_name().ok_or_else(|| ImageStoreError::Io {
        path: path.to_path_buf(),
        message: String::from("store path is missing a filename"),
    })
}

fn path_exists(path: &Utf8Path) -> Result<bool, ImageStoreError> {
    let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    let file_name = require_file_name(path)?;
    let dir = open_dir(parent)?;
    dir.try_exists(file_name).map_err(|err| ImageStoreError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

fn remove_file(path: &Utf8Path) -> Result<(), ImageStoreError> {
    std::fs::remove_file(path).map_err(|err| ImageStoreError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

fn file_size(path: &Utf8Path) -> Result<u64, ImageStoreError> {
    std::fs::metadata(path)
        .map(|meta| meta.len())
        .map_err(|err| ImageStoreError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
}

fn dir_file_names(dir: &Utf8Path) -> Result<Vec<String>, ImageStoreError> {
    let io_error = |err: &dyn std::fmt::Display| ImageStoreError::Io {
        path: dir.to_path_buf(),
        message: err.to_string(),
    };

    let mut names = Vec::new();
    for entry in dir.read_dir_utf8().map_err(|err| io_error(&err))? {
        let entry = entry.map_err(|err| io_error(&err))?;
        names.push(entry.file_name().to_owned());
    }
    names.sort();
    Ok(names)
}
