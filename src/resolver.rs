//! Workflow resolution.
//!
//! Pure decision function from the caller's privileges, the request and the
//! host policy to exactly one [`ExecutionMode`]. No I/O, no side effects
//! beyond logging the reason for a fallback.
//!
//! ```text
//!   no setuid build, non-root ─────────────────────────► UserNamespace
//!   root | in userns | --userns | allow setuid = no ──┬─► UserNamespace (fallback)
//!                                                     └─► Setuid (root with CAP_SYS_ADMIN)
//!   otherwise ─────────────────────────────────────────► Setuid
//!   --fakeroot ────────────────────────────────────────► Fakeroot { setuid_assisted }
//! ```

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::constants::CAP_SYS_ADMIN;
use crate::error::{Error, Result};
use crate::probe::CapabilityProbe;
use crate::request::LaunchRequest;

/// Privilege workflow used to start the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Setuid starter, no user namespace.
    Setuid,
    /// Unprivileged starter with a 1:1 user namespace mapping.
    UserNamespace,
    /// User namespace with the caller mapped to root. With
    /// `setuid_assisted` the setuid starter installs the extended
    /// subordinate ID map.
    Fakeroot { setuid_assisted: bool },
}

impl ExecutionMode {
    /// Returns true if the container gets its own user namespace.
    pub fn uses_user_namespace(self) -> bool {
        !matches!(self, Self::Setuid)
    }

    /// Returns true if the setuid starter performs the launch.
    pub fn needs_setuid_starter(self) -> bool {
        matches!(
            self,
            Self::Setuid
                | Self::Fakeroot {
                    setuid_assisted: true
                }
        )
    }

    /// Returns true for either fakeroot variant.
    pub fn is_fakeroot(self) -> bool {
        matches!(self, Self::Fakeroot { .. })
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Setuid => write!(f, "setuid"),
            Self::UserNamespace => write!(f, "user namespace"),
            Self::Fakeroot {
                setuid_assisted: true,
            } => write!(f, "fakeroot (setuid)"),
            Self::Fakeroot {
                setuid_assisted: false,
            } => write!(f, "fakeroot (user namespace)"),
        }
    }
}

/// Static host policy consulted by the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostPolicy {
    /// The install ships a setuid starter.
    pub setuid_install: bool,
    /// The administrator allows the setuid workflow.
    pub allow_setuid: bool,
}

/// Reason a launch fell back to a user namespace, kept for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fallback {
    NoSetuidBuild,
    Requested,
    AlreadyNested,
    HostPolicy,
    MissingCapability,
}

/// Resolves the execution mode for a launch.
///
/// Deterministic for identical inputs. For a non-root caller, never returns
/// a mode that needs the setuid starter when `policy.setuid_install` is
/// false. Root runs the privileged starter directly, so it may still get
/// [`ExecutionMode::Setuid`] on such hosts.
pub fn resolve(
    probe: &CapabilityProbe,
    request: &LaunchRequest,
    policy: HostPolicy,
) -> Result<ExecutionMode> {
    let base = match base_mode(probe, request, policy) {
        Ok(()) => ExecutionMode::Setuid,
        Err(reason) => {
            log_fallback(reason, probe);
            ExecutionMode::UserNamespace
        }
    };

    check_policy(probe, request)?;

    let mode = if request.fakeroot {
        ExecutionMode::Fakeroot {
            setuid_assisted: base == ExecutionMode::Setuid && !probe.is_root(),
        }
    } else {
        base
    };

    if request.nvccli
        && mode
            == (ExecutionMode::Fakeroot {
                setuid_assisted: true,
            })
    {
        return Err(Error::IncompatibleOptions(
            "--fakeroot and --nvccli cannot be combined on the setuid workflow; use --userns or --nv"
                .to_string(),
        ));
    }

    if request.boot && mode == ExecutionMode::UserNamespace && !probe.is_root() {
        return Err(Error::RequiresRoot {
            feature: "--boot without --fakeroot".to_string(),
        });
    }

    debug!("resolved execution mode: {} ({})", mode, probe);
    Ok(mode)
}

fn base_mode(
    probe: &CapabilityProbe,
    request: &LaunchRequest,
    policy: HostPolicy,
) -> std::result::Result<(), Fallback> {
    if !probe.is_root() && !policy.setuid_install {
        return Err(Fallback::NoSetuidBuild);
    }

    let evaluate = probe.is_root()
        || probe.inside_user_namespace
        || request.user_namespace
        || !policy.allow_setuid;
    if !evaluate {
        return Ok(());
    }

    if !probe.is_root() && !policy.allow_setuid {
        return Err(Fallback::HostPolicy);
    }
    if probe.is_root() && !probe.has_capability(CAP_SYS_ADMIN) {
        return Err(Fallback::MissingCapability);
    }
    if request.user_namespace {
        return Err(Fallback::Requested);
    }
    if probe.inside_user_namespace {
        return Err(Fallback::AlreadyNested);
    }
    Ok(())
}

fn check_policy(probe: &CapabilityProbe, request: &LaunchRequest) -> Result<()> {
    if request.apply_cgroups.is_some() && !probe.is_root() {
        return Err(Error::RequiresRoot {
            feature: "--apply-cgroups".to_string(),
        });
    }
    Ok(())
}

fn log_fallback(reason: Fallback, probe: &CapabilityProbe) {
    match reason {
        Fallback::NoSetuidBuild => {
            debug!("install has no setuid support, using user namespace workflow")
        }
        Fallback::Requested => debug!("user namespace requested"),
        Fallback::AlreadyNested => {
            debug!("already running in a user namespace, using user namespace workflow")
        }
        Fallback::HostPolicy => info!(
            "setuid workflow disabled by host policy, falling back to user namespace (uid {})",
            probe.uid
        ),
        Fallback::MissingCapability => info!(
            "running as root without CAP_SYS_ADMIN, falling back to user namespace"
        ),
    }
}
