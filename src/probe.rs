//! Caller identity and privilege detection.
//!
//! Takes one immutable snapshot of who is launching the container: real
//! UID/GID, whether the process already lives inside a user namespace, and
//! the effective capability set. The snapshot feeds the workflow resolver
//! and is never refreshed during a launch.

use std::fs;

/// Effective Linux capability bitset (`CapEff` in `/proc/self/status`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CapabilitySet(u64);

impl CapabilitySet {
    /// Empty set.
    pub const EMPTY: Self = Self(0);

    /// Creates a set from a raw bitmask.
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Returns the raw bitmask.
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Returns a copy of this set with capability `cap` added.
    pub const fn with(self, cap: u8) -> Self {
        Self(self.0 | (1u64 << cap))
    }

    /// Returns true if capability number `cap` is in the set.
    pub const fn contains(self, cap: u8) -> bool {
        cap < 64 && self.0 & (1u64 << cap) != 0
    }

    /// Parses the hexadecimal `CapEff:` value of a `/proc/<pid>/status` file.
    pub fn from_proc_status(status: &str) -> Option<Self> {
        status
            .lines()
            .find_map(|line| line.strip_prefix("CapEff:"))
            .and_then(|hex| u64::from_str_radix(hex.trim(), 16).ok())
            .map(Self)
    }
}

/// Snapshot of the caller's privileges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityProbe {
    /// Real user ID of the caller.
    pub uid: u32,
    /// Real group ID of the caller.
    pub gid: u32,
    /// The calling process already runs inside a user namespace.
    pub inside_user_namespace: bool,
    /// Effective capabilities of the calling process.
    pub effective: CapabilitySet,
}

impl CapabilityProbe {
    /// Probes the current process.
    pub fn detect() -> Self {
        // SAFETY: getuid/getgid cannot fail and have no preconditions.
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };

        let inside_user_namespace = fs::read_to_string("/proc/self/uid_map")
            .map(|map| uid_map_is_nested(&map))
            .unwrap_or(false);

        let effective = fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|s| CapabilitySet::from_proc_status(&s))
            .unwrap_or(CapabilitySet::EMPTY);

        Self {
            uid,
            gid,
            inside_user_namespace,
            effective,
        }
    }

    /// Builds a probe from known values.
    pub fn from_parts(
        uid: u32,
        gid: u32,
        inside_user_namespace: bool,
        effective: CapabilitySet,
    ) -> Self {
        Self {
            uid,
            gid,
            inside_user_namespace,
            effective,
        }
    }

    /// Returns true if the caller is UID 0.
    pub fn is_root(&self) -> bool {
        self.uid == 0
    }

    /// Returns true if the caller is root in the initial user namespace.
    pub fn is_host_root(&self) -> bool {
        self.is_root() && !self.inside_user_namespace
    }

    /// Returns true if the effective set holds capability `cap`.
    pub fn has_capability(&self, cap: u8) -> bool {
        self.effective.contains(cap)
    }
}

/// Returns true unless `uid_map` is the identity map of the initial
/// namespace (`0 0 4294967295`).
fn uid_map_is_nested(uid_map: &str) -> bool {
    let mut lines = uid_map.lines().filter(|l| !l.trim().is_empty());
    let Some(first) = lines.next() else {
        return false;
    };
    let fields: Vec<&str> = first.split_whitespace().collect();
    let identity = fields == ["0", "0", "4294967295"];
    !identity || lines.next().is_some()
}

impl std::fmt::Display for CapabilityProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "uid={} gid={} userns={} capeff={:016x}",
            self.uid,
            self.gid,
            self.inside_user_namespace,
            self.effective.bits()
        )
    }
}
