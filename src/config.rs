//! Host configuration.
//!
//! Static, administrator-controlled policy loaded from `sifrun.toml`. The
//! file is read fresh on every invocation and never written by the engine.
//! Only host root may point [`HostConfig::load`] at another file. Whether
//! the install ships a setuid starter is a build property
//! ([`SETUID_INSTALL`]) and cannot be set here.
//!
//! ```toml
//! allow_setuid = true
//! config_dir = "/etc/sifrun"
//! starter = "/usr/libexec/sifrun/bin/starter"
//! starter_suid = "/usr/libexec/sifrun/bin/starter-suid"
//! temp_dir = "/tmp"
//! sandboxed_extraction = true
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::constants::{
    CONFIG_FILE_ENV, DEFAULT_CONFIG_DIR, DEFAULT_CONFIG_FILE, DEFAULT_STARTER,
    DEFAULT_STARTER_SUID, DEFAULT_TEMP_DIR, DEFAULT_UNSQUASHFS, INSTANCE_DIR, NVIDIA_LIBLIST,
    ROCM_LIBLIST, SETUID_INSTALL, USER_STATE_DIR,
};
use crate::error::{Error, Result};
use crate::probe::CapabilityProbe;

/// Host policy and install layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    /// Administrator allows the setuid workflow.
    pub allow_setuid: bool,

    /// Directory holding GPU allow-lists.
    pub config_dir: PathBuf,

    /// Unprivileged starter binary.
    pub starter: PathBuf,

    /// Setuid starter binary.
    pub starter_suid: PathBuf,

    /// The install was built with setuid support. Defaults to
    /// [`SETUID_INSTALL`]; not accepted from the configuration file.
    #[serde(skip, default = "default_setuid_install")]
    pub setuid_install: bool,

    /// Root for temporary sandbox conversions.
    pub temp_dir: PathBuf,

    /// Per-user instance registry. Defaults to `~/.sifrun/instances`.
    pub instance_dir: Option<PathBuf>,

    /// Squashfs extractor.
    pub unsquashfs: PathBuf,

    /// Dynamic linker cache tool.
    pub ldconfig: PathBuf,

    /// NVIDIA container CLI.
    pub nvidia_container_cli: PathBuf,

    /// Run the extractor inside a nested minimal container when not root.
    pub sandboxed_extraction: bool,

    /// Name of the image driver plugin that handles single-file images.
    pub image_driver: Option<String>,

    /// Mount the caller's home directory by default.
    pub mount_home: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            allow_setuid: true,
            config_dir: PathBuf::from(DEFAULT_CONFIG_DIR),
            starter: PathBuf::from(DEFAULT_STARTER),
            starter_suid: PathBuf::from(DEFAULT_STARTER_SUID),
            setuid_install: SETUID_INSTALL,
            temp_dir: PathBuf::from(DEFAULT_TEMP_DIR),
            instance_dir: None,
            unsquashfs: PathBuf::from(DEFAULT_UNSQUASHFS),
            ldconfig: PathBuf::from("/sbin/ldconfig"),
            nvidia_container_cli: PathBuf::from("nvidia-container-cli"),
            sandboxed_extraction: true,
            image_driver: None,
            mount_home: true,
        }
    }
}

impl HostConfig {
    /// Loads the host configuration for the caller described by `probe`.
    /// A missing file yields the defaults.
    pub fn load(probe: &CapabilityProbe) -> Result<Self> {
        let path = config_path(probe, std::env::var_os(CONFIG_FILE_ENV));
        if !path.exists() {
            debug!("no host configuration at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::from_file(&path)
    }

    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Returns true if the install ships a setuid starter.
    pub fn setuid_support(&self) -> bool {
        self.setuid_install
    }

    /// Path of the NVIDIA legacy allow-list.
    pub fn nvidia_liblist(&self) -> PathBuf {
        self.config_dir.join(NVIDIA_LIBLIST)
    }

    /// Path of the ROCm allow-list.
    pub fn rocm_liblist(&self) -> PathBuf {
        self.config_dir.join(ROCM_LIBLIST)
    }

    /// Resolves a host tool. Absolute paths must exist; bare names are
    /// searched in `path_var`, or a fixed system `PATH` when absent.
    pub fn resolve_tool(&self, tool: &Path, path_var: Option<&str>) -> Result<PathBuf> {
        let not_found = |reason: String| Error::ToolNotFound {
            tool: tool.display().to_string(),
            reason,
        };

        if tool.is_absolute() {
            return if tool.is_file() {
                Ok(tool.to_path_buf())
            } else {
                Err(not_found("no such file".to_string()))
            };
        }

        let search = path_var.unwrap_or(DEFAULT_SEARCH_PATH);
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        which::which_in(tool, Some(search), cwd)
            .map_err(|e| not_found(format!("{} (searched {})", e, search)))
    }

    /// Resolves the per-user instance registry directory.
    pub fn instance_root(&self) -> PathBuf {
        if let Some(dir) = &self.instance_dir {
            return dir.clone();
        }
        dirs::home_dir()
            .map(|h| h.join(USER_STATE_DIR).join(INSTANCE_DIR))
            .unwrap_or_else(|| PathBuf::from(USER_STATE_DIR).join(INSTANCE_DIR))
    }
}

fn default_setuid_install() -> bool {
    SETUID_INSTALL
}

const DEFAULT_SEARCH_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Picks the configuration file. `override_path` (from
/// [`CONFIG_FILE_ENV`]) is only honoured for host root.
pub fn config_path(probe: &CapabilityProbe, override_path: Option<OsString>) -> PathBuf {
    match override_path {
        Some(path) if probe.is_host_root() => PathBuf::from(path),
        Some(path) => {
            warn!(
                "ignoring {}={} for non-root caller",
                CONFIG_FILE_ENV,
                PathBuf::from(path).display()
            );
            PathBuf::from(DEFAULT_CONFIG_FILE)
        }
        None => PathBuf::from(DEFAULT_CONFIG_FILE),
    }
}
