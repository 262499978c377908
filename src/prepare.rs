//! # Image Preparer
//!
//! Decides whether an image can be handed to the starter as-is, needs key
//! material, or must first be converted into a temporary sandbox
//! directory.
//!
//! ```text
//!            ┌────────┐  encrypted   ┌─────────────────┐
//! open ────► │ Direct │ ───────────► │ NeedsDecryption │
//!            └───┬────┘              └────────┬────────┘
//!                │ single file in a user namespace, no driver
//!                ▼                            ▼
//!        ┌─────────────────┐  extract  ┌───────────┐
//!        │ NeedsConversion │ ────────► │ Converted │
//!        └─────────────────┘           └───────────┘
//! ```
//!
//! A conversion directory is owned by a [`SandboxConversion`] guard and
//! removed on drop. Ownership passes to the starter when the process is
//! replaced, or to the instance record when the guard is persisted.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::HostConfig;
use crate::constants::{CONVERSION_DIR_PREFIX, ROOTFS_DIR};
use crate::encryption::{self, PassphrasePrompt};
use crate::engine::ConfigBuilder;
use crate::error::{Error, Result};
use crate::extractor::{ExtractionMode, Extractor};
use crate::image::{Image, ImageFormat, Partition};
use crate::probe::CapabilityProbe;
use crate::request::LaunchRequest;

// =============================================================================
// Image drivers
// =============================================================================

/// A host plugin able to mount single-file images itself, making sandbox
/// conversion unnecessary.
pub trait ImageDriver: std::fmt::Debug {
    /// Name the host configuration refers to the driver by.
    fn name(&self) -> &str;

    /// Returns true if the driver can mount images of `format`.
    fn supports(&self, format: &ImageFormat) -> bool;
}

/// Registered image drivers.
#[derive(Debug, Default)]
pub struct DriverRegistry {
    drivers: Vec<Box<dyn ImageDriver>>,
}

impl DriverRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a driver. A later driver with the same name shadows an earlier one.
    pub fn register(&mut self, driver: Box<dyn ImageDriver>) {
        debug!("registered image driver {}", driver.name());
        self.drivers.push(driver);
    }

    /// Looks up a driver by name.
    pub fn get(&self, name: &str) -> Option<&dyn ImageDriver> {
        self.drivers
            .iter()
            .rev()
            .find(|d| d.name() == name)
            .map(|d| d.as_ref())
    }
}

// =============================================================================
// Conversion guard
// =============================================================================

/// Temporary sandbox directory produced from a single-file image.
///
/// ```text
/// <temp_root>/sifrun-rootfs-<uuid>/
/// ├── rootfs/              extracted root filesystem (the new image)
/// └── <name>.squashfs      staged SIF partition, removed after extraction
/// ```
#[derive(Debug)]
pub struct SandboxConversion {
    source: PathBuf,
    dir: PathBuf,
    rootfs: PathBuf,
    owned: bool,
}

impl SandboxConversion {
    /// Allocates a fresh conversion directory under `temp_root`.
    pub fn create(temp_root: &Path, source: &Path) -> Result<Self> {
        fs::create_dir_all(temp_root).map_err(|e| Error::SandboxSetup {
            path: temp_root.to_path_buf(),
            reason: e.to_string(),
        })?;
        let dir = temp_root.join(format!("{}{}", CONVERSION_DIR_PREFIX, uuid::Uuid::now_v7()));
        fs::DirBuilder::new()
            .mode(0o700)
            .create(&dir)
            .map_err(|e| Error::SandboxSetup {
                path: dir.clone(),
                reason: e.to_string(),
            })?;
        debug!("allocated conversion directory {}", dir.display());
        Ok(Self {
            source: source.to_path_buf(),
            rootfs: dir.join(ROOTFS_DIR),
            dir,
            owned: true,
        })
    }

    /// Image the conversion was made from.
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Conversion directory, deleted as a whole.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Extracted root filesystem.
    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    /// Returns true while the guard still removes the directory on drop.
    pub fn is_owned(&self) -> bool {
        self.owned
    }

    /// Hands the directory over to another owner and returns its path.
    pub fn persist(mut self) -> PathBuf {
        self.owned = false;
        self.dir.clone()
    }
}

impl Drop for SandboxConversion {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        debug!("removing conversion directory {}", self.dir.display());
        if let Err(e) = fs::remove_dir_all(&self.dir)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(
                "failed to remove conversion directory {}: {}",
                self.dir.display(),
                e
            );
        }
    }
}

// =============================================================================
// Preparer
// =============================================================================

/// Preparation state reached for an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareState {
    /// Image passed to the starter unchanged.
    Direct,
    /// Image passed unchanged, with key material attached.
    NeedsDecryption,
    /// Conversion was required but has not completed.
    NeedsConversion,
    /// Image replaced by an extracted sandbox directory.
    Converted,
}

/// Result of [`ImagePreparer::prepare`].
#[derive(Debug)]
pub struct Preparation {
    /// Image as detected before any conversion.
    pub image: Image,
    /// Final state.
    pub state: PrepareState,
    /// Conversion guard when `state` is [`PrepareState::Converted`].
    pub conversion: Option<SandboxConversion>,
}

/// Runs image preparation for one launch.
pub struct ImagePreparer<'a> {
    host: &'a HostConfig,
    probe: &'a CapabilityProbe,
    drivers: &'a DriverRegistry,
    prompt: &'a dyn PassphrasePrompt,
    runtime: Option<PathBuf>,
}

impl<'a> ImagePreparer<'a> {
    pub fn new(
        host: &'a HostConfig,
        probe: &'a CapabilityProbe,
        drivers: &'a DriverRegistry,
        prompt: &'a dyn PassphrasePrompt,
    ) -> Self {
        Self {
            host,
            probe,
            drivers,
            prompt,
            runtime: None,
        }
    }

    /// Uses `runtime` for nested sandboxed extraction instead of the
    /// current executable.
    pub fn with_runtime(mut self, runtime: PathBuf) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Prepares the requested image and records the outcome on `builder`.
    pub fn prepare(
        &self,
        request: &LaunchRequest,
        builder: &mut ConfigBuilder<'_>,
    ) -> Result<Preparation> {
        let image = Image::open(&request.image)?;
        debug!("image {} is {}", image.path.display(), image.format.name());
        builder.set_image(image.path.clone());

        // Decided before any key is resolved: an encrypted image that would
        // need extraction fails without prompting for a passphrase.
        let convert = self.needs_conversion(&image, builder);
        if convert && image.format.is_encrypted() {
            return Err(Error::UnsupportedImageFormat {
                path: image.path.clone(),
                reason: "encrypted images cannot be extracted in a user namespace".to_string(),
            });
        }

        let mut state = PrepareState::Direct;
        if image.format.is_encrypted() {
            state = PrepareState::NeedsDecryption;
            let key = encryption::resolve_key(&image.path, request, self.prompt)?;
            builder.set_key(key);
        }

        if !convert {
            return Ok(Preparation {
                image,
                state,
                conversion: None,
            });
        }

        if !image.format.is_squashfs() {
            return Err(Error::UnsupportedImageFormat {
                path: image.path.clone(),
                reason: format!(
                    "{} images cannot be extracted in a user namespace",
                    image.format.name()
                ),
            });
        }

        info!(
            "converting {} to a temporary sandbox for the {} workflow",
            image.path.display(),
            builder.mode()
        );
        let conversion = self.convert(&image, request)?;
        builder.set_image(conversion.rootfs().to_path_buf());
        builder.set_delete_image_dir(conversion.dir().to_path_buf());

        Ok(Preparation {
            image,
            state: PrepareState::Converted,
            conversion: Some(conversion),
        })
    }

    fn needs_conversion(&self, image: &Image, builder: &ConfigBuilder<'_>) -> bool {
        if !image.format.is_single_file() {
            return false;
        }
        if !builder.mode().uses_user_namespace() && !self.probe.inside_user_namespace {
            return false;
        }
        if let Some(name) = &self.host.image_driver {
            match self.drivers.get(name) {
                Some(driver) if driver.supports(&image.format) => {
                    debug!(
                        "image driver {} mounts {} images, skipping conversion",
                        name,
                        image.format.name()
                    );
                    return false;
                }
                Some(_) => debug!(
                    "image driver {} does not support {} images",
                    name,
                    image.format.name()
                ),
                None => warn!("configured image driver {} is not registered", name),
            }
        }
        true
    }

    fn convert(&self, image: &Image, request: &LaunchRequest) -> Result<SandboxConversion> {
        let conversion = SandboxConversion::create(&self.host.temp_dir, &image.path)?;

        let staged = match &image.format {
            ImageFormat::Sif(partition) => {
                Some(stage_partition(&image.path, partition, conversion.dir())?)
            }
            _ => None,
        };
        let source = staged.as_deref().unwrap_or(image.path.as_path());

        let extractor = self.extractor(request)?;
        extractor.extract(source, conversion.rootfs(), &[])?;

        if let Some(staged) = &staged
            && let Err(e) = fs::remove_file(staged)
        {
            warn!("failed to remove staged partition {}: {}", staged.display(), e);
        }
        Ok(conversion)
    }

    fn extractor(&self, request: &LaunchRequest) -> Result<Extractor> {
        let tool = self
            .host
            .resolve_tool(&self.host.unsquashfs, request.host_var("PATH"))?;
        let mode = if self.probe.is_host_root() || !self.host.sandboxed_extraction {
            ExtractionMode::Direct
        } else {
            let runtime = match &self.runtime {
                Some(r) => r.clone(),
                None => std::env::current_exe()?,
            };
            ExtractionMode::Sandboxed { runtime }
        };
        Ok(Extractor::new(tool, mode))
    }
}

/// Copies a SIF partition into `dir` as a standalone squashfs file.
pub fn stage_partition(image: &Path, partition: &Partition, dir: &Path) -> Result<PathBuf> {
    let stem = image
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let staged = dir.join(format!("{}.squashfs", stem));

    let mut src = File::open(image).map_err(|e| Error::ImageNotFound {
        path: image.to_path_buf(),
        reason: e.to_string(),
    })?;
    src.seek(SeekFrom::Start(partition.offset))?;
    let mut dst = File::create(&staged).map_err(|e| Error::SandboxSetup {
        path: staged.clone(),
        reason: e.to_string(),
    })?;
    let copied = io::copy(&mut src.take(partition.size), &mut dst)?;
    if copied != partition.size {
        return Err(Error::InvalidSif {
            path: image.to_path_buf(),
            reason: format!(
                "partition truncated: expected {} bytes, found {}",
                partition.size, copied
            ),
        });
    }
    debug!(
        "staged {} byte partition of {} at {}",
        copied,
        image.display(),
        staged.display()
    );
    Ok(staged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_removed_on_drop() {
        let tmp = tempfile::TempDir::new().unwrap();
        let conv = SandboxConversion::create(tmp.path(), Path::new("/img.sif")).unwrap();
        let dir = conv.dir().to_path_buf();
        assert!(dir.is_dir());
        assert!(dir
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(CONVERSION_DIR_PREFIX));
        drop(conv);
        assert!(!dir.exists());
    }

    #[test]
    fn test_persisted_conversion_survives() {
        let tmp = tempfile::TempDir::new().unwrap();
        let conv = SandboxConversion::create(tmp.path(), Path::new("/img.sif")).unwrap();
        let dir = conv.persist();
        assert!(dir.is_dir());
    }
}
