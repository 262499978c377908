//! # Launch Engine Constants
//!
//! Default paths, protocol identifiers, thresholds and input validation
//! helpers for the launch engine. Host-specific values can be overridden in
//! `sifrun.toml` (see [`crate::config`]); these are the fallbacks.
//!
//! ## Cross-References
//!
//! - [`crate::resolver`]: Uses capability numbers
//! - [`crate::engine`]: Uses the human-user threshold and allow-list names
//! - [`crate::handoff`]: Uses the payload descriptor and message-level env
//! - [`crate::instance`]: Uses the instance name rules and file names

use std::time::Duration;

// =============================================================================
// Host Paths
// =============================================================================

/// Default location of the host configuration file.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/sifrun/sifrun.toml";

/// Environment variable that overrides [`DEFAULT_CONFIG_FILE`].
///
/// **Security**: Only honoured for host root. Any other caller always gets
/// the fixed path so the policy stays under administrator control.
pub const CONFIG_FILE_ENV: &str = "SIFRUN_CONFIG";

/// Whether this build ships a setuid starter (`suid` cargo feature).
///
/// Fixed at build time, never read from the host configuration file.
pub const SETUID_INSTALL: bool = cfg!(feature = "suid");

/// Default directory holding GPU allow-lists and other static host config.
pub const DEFAULT_CONFIG_DIR: &str = "/etc/sifrun";

/// Default unprivileged starter.
pub const DEFAULT_STARTER: &str = "/usr/libexec/sifrun/bin/starter";

/// Default setuid-installed starter.
pub const DEFAULT_STARTER_SUID: &str = "/usr/libexec/sifrun/bin/starter-suid";

/// Default root for temporary sandbox conversions.
pub const DEFAULT_TEMP_DIR: &str = "/tmp";

/// Per-user state directory, relative to the home directory.
///
/// Structure: `~/.sifrun/instances/<name>/{instance.json,stdout.log,stderr.log}`
pub const USER_STATE_DIR: &str = ".sifrun";

/// Subdirectory of [`USER_STATE_DIR`] holding instance records.
pub const INSTANCE_DIR: &str = "instances";

// =============================================================================
// Privilege Handoff
// =============================================================================

/// Engine name carried in every starter message.
pub const ENGINE_NAME: &str = "sifrun";

/// Version of the starter message schema.
///
/// Bumped whenever a field of [`crate::handoff::StarterMessage`] changes
/// meaning. The starter refuses messages with a version it does not know.
pub const STARTER_MESSAGE_VERSION: u32 = 1;

/// File descriptor on which the starter reads its payload.
pub const STARTER_PAYLOAD_FD: i32 = 3;

/// Process name passed as `argv[0]` to the starter.
pub const STARTER_PROCNAME: &str = "sifrun-starter";

/// Environment variable carrying the log verbosity to the starter.
pub const MESSAGE_LEVEL_ENV: &str = "SIFRUN_MESSAGELEVEL";

/// Delay before re-reading an instance's stderr log after spawning it.
///
/// The starter reports some setup errors after the spawn call has
/// returned. Output that shows up within this window is echoed to the
/// user as a warning. This is a heuristic, not a readiness signal.
pub const INSTANCE_GRACE_PERIOD: Duration = Duration::from_millis(100);

// =============================================================================
// Configuration Builder
// =============================================================================

/// Target UIDs at or below this value are treated as system accounts.
///
/// When `--security uid:N` selects a system account, home mounting is
/// disabled instead of resolving a host home directory.
pub const HUMAN_UID_THRESHOLD: u32 = 500;

/// Host environment variables with this prefix are forwarded into the
/// container with the prefix stripped.
pub const ENV_FORWARD_PREFIX: &str = "SIFRUN_ENV_";

/// NVIDIA legacy allow-list, relative to the config directory.
pub const NVIDIA_LIBLIST: &str = "nvliblist.conf";

/// ROCm allow-list, relative to the config directory.
pub const ROCM_LIBLIST: &str = "rocmliblist.conf";

/// IPC sockets probed for legacy NVIDIA binding.
pub const NVIDIA_IPC_SOCKETS: &[&str] = &[
    "/var/run/nvidia-persistenced/socket",
    "/var/run/nvidia-fabricmanager/socket",
];

/// Linux capability number of `CAP_SYS_ADMIN`.
pub const CAP_SYS_ADMIN: u8 = 21;

// =============================================================================
// Image Encryption
// =============================================================================

/// Environment variable naming a PEM file for decryption.
pub const PEM_PATH_ENV: &str = "SIFRUN_ENCRYPTION_PEM_PATH";

/// Environment variable carrying a decryption passphrase.
pub const PASSPHRASE_ENV: &str = "SIFRUN_ENCRYPTION_PASSPHRASE";

// =============================================================================
// Sandboxed Extraction
// =============================================================================

/// Default squashfs extractor, searched in `PATH` when not absolute.
pub const DEFAULT_UNSQUASHFS: &str = "unsquashfs";

/// Directories created in every extractor sandbox root.
pub const SANDBOX_MINIMAL_DIRS: &[&str] = &["dev", "etc", "proc", "sys", "tmp"];

/// Name of the extracted root filesystem inside a conversion directory.
pub const ROOTFS_DIR: &str = "rootfs";

/// Prefix of conversion directories under the temp root.
pub const CONVERSION_DIR_PREFIX: &str = "sifrun-rootfs-";

// =============================================================================
// Validation Patterns
// =============================================================================

/// Valid characters for instance names.
///
/// **Security**: Excludes `/` and `.` so names can be used as path
/// components without traversal.
pub const INSTANCE_NAME_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";

/// Maximum instance name length.
pub const MAX_INSTANCE_NAME_LEN: usize = 128;

/// Validates an instance name for use as a registry key.
#[inline]
#[must_use = "validation result must be checked to ensure the instance name is safe"]
pub fn validate_instance_name(name: &str) -> std::result::Result<(), &'static str> {
    if name.is_empty() {
        return Err("instance name cannot be empty");
    }
    if name.len() > MAX_INSTANCE_NAME_LEN {
        return Err("instance name exceeds maximum length");
    }
    if !name.chars().all(|c| INSTANCE_NAME_VALID_CHARS.contains(c)) {
        return Err("instance name contains invalid characters");
    }
    Ok(())
}
