//! The sealed engine configuration and the builder that produces it.
//!
//! [`ConfigBuilder`] accumulates settings in any order, validates them
//! together, and seals them into an [`EngineConfig`]. An `EngineConfig` has
//! no setters: it is handed to the starter exactly as it was sealed.

pub mod builder;
pub mod gpu;

pub use builder::ConfigBuilder;
pub use gpu::{GpuBindings, GpuMode};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::encryption::KeyMaterial;
use crate::resolver::ExecutionMode;

/// One bind mount performed by the starter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    /// Host path.
    pub source: PathBuf,
    /// Path inside the container.
    pub dest: PathBuf,
    /// Mount read-only.
    pub read_only: bool,
}

impl BindMount {
    /// Creates a bind mount.
    pub fn new(source: impl Into<PathBuf>, dest: impl Into<PathBuf>, read_only: bool) -> Self {
        Self {
            source: source.into(),
            dest: dest.into(),
            read_only,
        }
    }

    /// Renders the bind in `src:dest[:ro]` form.
    pub fn to_spec(&self) -> String {
        let mut spec = format!("{}:{}", self.source.display(), self.dest.display());
        if self.read_only {
            spec.push_str(":ro");
        }
        spec
    }
}

/// Namespaces the starter unshares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespaces {
    pub net: bool,
    pub uts: bool,
    pub pid: bool,
    pub ipc: bool,
    pub user: bool,
}

/// One line of a `uid_map`/`gid_map`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapEntry {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

/// Home directory mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HomeMount {
    pub source: PathBuf,
    pub dest: PathBuf,
}

/// Finalized, self-consistent launch description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub(crate) mode: ExecutionMode,
    pub(crate) image: PathBuf,
    pub(crate) delete_image_dir: Option<PathBuf>,
    pub(crate) args: Vec<String>,
    pub(crate) binds: Vec<BindMount>,
    pub(crate) namespaces: Namespaces,
    pub(crate) add_caps: Vec<String>,
    pub(crate) drop_caps: Vec<String>,
    pub(crate) gpu: GpuBindings,
    pub(crate) key: Option<KeyMaterial>,
    pub(crate) home: Option<HomeMount>,
    pub(crate) workdir: Option<PathBuf>,
    pub(crate) cwd: Option<PathBuf>,
    pub(crate) env: BTreeMap<String, String>,
    pub(crate) clean_env: bool,
    pub(crate) instance: Option<String>,
    pub(crate) umask: Option<u32>,
    pub(crate) writable: bool,
    pub(crate) writable_tmpfs: bool,
    pub(crate) contain: bool,
    pub(crate) no_init: bool,
    pub(crate) boot: bool,
    pub(crate) uid_map: Vec<IdMapEntry>,
    pub(crate) gid_map: Vec<IdMapEntry>,
    pub(crate) target_uid: Option<u32>,
    pub(crate) target_gids: Vec<u32>,
    pub(crate) cgroups_file: Option<PathBuf>,
}

impl EngineConfig {
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Image path, or the inner root of a converted sandbox.
    pub fn image(&self) -> &Path {
        &self.image
    }

    /// Temporary conversion directory the starter must remove on exit.
    pub fn delete_image_dir(&self) -> Option<&Path> {
        self.delete_image_dir.as_deref()
    }

    /// Returns true if the image is a temporary sandbox.
    pub fn image_is_deletable(&self) -> bool {
        self.delete_image_dir.is_some()
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn binds(&self) -> &[BindMount] {
        &self.binds
    }

    pub fn namespaces(&self) -> Namespaces {
        self.namespaces
    }

    pub fn add_caps(&self) -> &[String] {
        &self.add_caps
    }

    pub fn drop_caps(&self) -> &[String] {
        &self.drop_caps
    }

    pub fn gpu(&self) -> &GpuBindings {
        &self.gpu
    }

    pub fn key(&self) -> Option<&KeyMaterial> {
        self.key.as_ref()
    }

    /// Home mount, `None` when home mounting is disabled.
    pub fn home(&self) -> Option<&HomeMount> {
        self.home.as_ref()
    }

    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_deref()
    }

    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn clean_env(&self) -> bool {
        self.clean_env
    }

    pub fn instance(&self) -> Option<&str> {
        self.instance.as_deref()
    }

    pub fn umask(&self) -> Option<u32> {
        self.umask
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn writable_tmpfs(&self) -> bool {
        self.writable_tmpfs
    }

    pub fn contain(&self) -> bool {
        self.contain
    }

    pub fn no_init(&self) -> bool {
        self.no_init
    }

    pub fn boot(&self) -> bool {
        self.boot
    }

    pub fn uid_map(&self) -> &[IdMapEntry] {
        &self.uid_map
    }

    pub fn gid_map(&self) -> &[IdMapEntry] {
        &self.gid_map
    }

    pub fn target_uid(&self) -> Option<u32> {
        self.target_uid
    }

    pub fn target_gids(&self) -> &[u32] {
        &self.target_gids
    }

    pub fn cgroups_file(&self) -> Option<&Path> {
        self.cgroups_file.as_deref()
    }
}
