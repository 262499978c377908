//! The launch request.
//!
//! One immutable value carrying every user-facing option of a launch, as
//! already parsed from the command line (or built by an embedding program).
//! The resolver and the configuration builder only ever read it.

use std::path::PathBuf;

/// Namespaces the caller asked to unshare in addition to the mount
/// namespace the starter always creates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NamespaceRequest {
    pub net: bool,
    pub uts: bool,
    pub pid: bool,
    pub ipc: bool,
}

/// Detached launch parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRequest {
    /// Registry key of the instance.
    pub name: String,
    /// Where to write the instance pid, if anywhere.
    pub pid_file: Option<PathBuf>,
}

/// Everything the caller asked for.
#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    /// Image path (SIF, squashfs, ext3 or sandbox directory).
    pub image: PathBuf,
    /// Process to run inside the container.
    pub args: Vec<String>,
    /// Start detached as a named instance.
    pub instance: Option<InstanceRequest>,

    // Workflow selection
    pub user_namespace: bool,
    pub fakeroot: bool,
    pub boot: bool,

    // Container shape
    pub contain: bool,
    pub containall: bool,
    pub no_init: bool,
    pub writable: bool,
    pub writable_tmpfs: bool,
    pub namespaces: NamespaceRequest,
    /// `-B` values, each possibly a comma separated list.
    pub binds: Vec<String>,
    /// `--add-caps` value.
    pub add_caps: Option<String>,
    /// `--drop-caps` value.
    pub drop_caps: Option<String>,

    // Accelerators
    pub nv: bool,
    pub nvccli: bool,
    pub rocm: bool,

    // Identity and environment
    /// `--home src[:dest]`.
    pub home: Option<String>,
    pub no_home: bool,
    pub workdir: Option<PathBuf>,
    pub pwd: Option<PathBuf>,
    /// `--env KEY=VALUE` values.
    pub env: Vec<String>,
    /// Snapshot of the caller's environment.
    pub host_env: Vec<(String, String)>,
    /// `--security` values, e.g. `uid:1001`.
    pub security: Vec<String>,
    pub apply_cgroups: Option<PathBuf>,
    pub no_umask: bool,

    // Encryption
    pub pem_path: Option<PathBuf>,
    /// Prompt for a passphrase.
    pub passphrase: bool,
}

impl LaunchRequest {
    /// Creates a request for `image` running `args`.
    pub fn new(image: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            image: image.into(),
            args,
            ..Default::default()
        }
    }

    /// Returns true if either legacy NVIDIA or the NVIDIA container CLI
    /// was requested.
    pub fn wants_nvidia(&self) -> bool {
        self.nv || self.nvccli
    }

    /// Looks up a variable in the captured host environment.
    pub fn host_var(&self, key: &str) -> Option<&str> {
        self.host_env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}
