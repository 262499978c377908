//! Configuration builder.
//!
//! Settings may be added in any order. [`ConfigBuilder::validate`] applies
//! the precedence rules and rejects incompatible combinations;
//! [`ConfigBuilder::seal`] validates once more, resolves host-dependent
//! values (GPU files, home directory, ID maps, umask) and produces the
//! immutable [`EngineConfig`].
//!
//! ## Precedence Rules (warn, never fail)
//!
//! | Requested                  | Kept       |
//! |----------------------------|------------|
//! | `writable` + `writable-tmpfs` | `writable` |
//! | `nv` + `rocm`              | `nv`       |
//!
//! ## Rejected Combinations
//!
//! - nvidia-cli on a user namespace workflow without `writable`
//! - nvidia-cli with setuid-assisted fakeroot
//! - `--home` with more than two `:` separated fields

use std::collections::BTreeMap;
use std::ffi::CStr;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::gpu::{self, GpuMode};
use super::{BindMount, EngineConfig, HomeMount, IdMapEntry, Namespaces};
use crate::config::HostConfig;
use crate::constants::{ENV_FORWARD_PREFIX, HUMAN_UID_THRESHOLD, validate_instance_name};
use crate::encryption::KeyMaterial;
use crate::error::{Error, Result};
use crate::probe::CapabilityProbe;
use crate::request::LaunchRequest;
use crate::resolver::ExecutionMode;

/// Linux capability names accepted by `--add-caps` / `--drop-caps`.
const LINUX_CAPABILITIES: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_DAC_READ_SEARCH",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_KILL",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETPCAP",
    "CAP_LINUX_IMMUTABLE",
    "CAP_NET_BIND_SERVICE",
    "CAP_NET_BROADCAST",
    "CAP_NET_ADMIN",
    "CAP_NET_RAW",
    "CAP_IPC_LOCK",
    "CAP_IPC_OWNER",
    "CAP_SYS_MODULE",
    "CAP_SYS_RAWIO",
    "CAP_SYS_CHROOT",
    "CAP_SYS_PTRACE",
    "CAP_SYS_PACCT",
    "CAP_SYS_ADMIN",
    "CAP_SYS_BOOT",
    "CAP_SYS_NICE",
    "CAP_SYS_RESOURCE",
    "CAP_SYS_TIME",
    "CAP_SYS_TTY_CONFIG",
    "CAP_MKNOD",
    "CAP_LEASE",
    "CAP_AUDIT_WRITE",
    "CAP_AUDIT_CONTROL",
    "CAP_SETFCAP",
    "CAP_MAC_OVERRIDE",
    "CAP_MAC_ADMIN",
    "CAP_SYSLOG",
    "CAP_WAKE_ALARM",
    "CAP_BLOCK_SUSPEND",
    "CAP_AUDIT_READ",
    "CAP_PERFMON",
    "CAP_BPF",
    "CAP_CHECKPOINT_RESTORE",
];

const SUBUID_FILE: &str = "/etc/subuid";
const SUBGID_FILE: &str = "/etc/subgid";

#[derive(Debug, Clone, PartialEq, Eq)]
enum HomeSpec {
    Caller,
    Custom(HomeMount),
    Disabled,
}

/// Accumulates launch settings and seals them into an [`EngineConfig`].
#[derive(Debug)]
pub struct ConfigBuilder<'a> {
    mode: ExecutionMode,
    probe: &'a CapabilityProbe,
    host: &'a HostConfig,
    image: PathBuf,
    delete_image_dir: Option<PathBuf>,
    args: Vec<String>,
    binds: Vec<BindMount>,
    namespaces: Namespaces,
    add_caps: Vec<String>,
    drop_caps: Vec<String>,
    nv: bool,
    nvccli: bool,
    rocm: bool,
    key: Option<KeyMaterial>,
    home: HomeSpec,
    workdir: Option<PathBuf>,
    cwd: Option<PathBuf>,
    env_explicit: BTreeMap<String, String>,
    env_forwarded: BTreeMap<String, String>,
    clean_env: bool,
    instance: Option<String>,
    propagate_umask: bool,
    writable: bool,
    writable_tmpfs: bool,
    contain: bool,
    no_init: bool,
    boot: bool,
    target_uid: Option<u32>,
    target_gids: Vec<u32>,
    cgroups_file: Option<PathBuf>,
    path_var: Option<String>,
    subid_files: (PathBuf, PathBuf),
}

impl<'a> ConfigBuilder<'a> {
    /// Creates an empty builder for `image` under the resolved `mode`.
    pub fn new(
        mode: ExecutionMode,
        probe: &'a CapabilityProbe,
        host: &'a HostConfig,
        image: impl Into<PathBuf>,
    ) -> Self {
        Self {
            mode,
            probe,
            host,
            image: image.into(),
            delete_image_dir: None,
            args: Vec::new(),
            binds: Vec::new(),
            namespaces: Namespaces::default(),
            add_caps: Vec::new(),
            drop_caps: Vec::new(),
            nv: false,
            nvccli: false,
            rocm: false,
            key: None,
            home: if host.mount_home {
                HomeSpec::Caller
            } else {
                HomeSpec::Disabled
            },
            workdir: None,
            cwd: None,
            env_explicit: BTreeMap::new(),
            env_forwarded: BTreeMap::new(),
            clean_env: false,
            instance: None,
            propagate_umask: true,
            writable: false,
            writable_tmpfs: false,
            contain: false,
            no_init: false,
            boot: false,
            target_uid: None,
            target_gids: Vec::new(),
            cgroups_file: None,
            path_var: None,
            subid_files: (PathBuf::from(SUBUID_FILE), PathBuf::from(SUBGID_FILE)),
        }
    }

    /// Creates a builder populated from every option of `request`.
    pub fn from_request(
        mode: ExecutionMode,
        probe: &'a CapabilityProbe,
        host: &'a HostConfig,
        request: &LaunchRequest,
    ) -> Result<Self> {
        let mut b = Self::new(mode, probe, host, request.image.clone());
        b.args = request.args.clone();
        b.namespaces = Namespaces {
            net: request.namespaces.net,
            uts: request.namespaces.uts,
            pid: request.namespaces.pid,
            ipc: request.namespaces.ipc,
            user: false,
        };
        for spec in &request.binds {
            b.add_binds(spec)?;
        }
        if let Some(caps) = &request.add_caps {
            b.add_caps(caps)?;
        }
        if let Some(caps) = &request.drop_caps {
            b.drop_caps(caps)?;
        }
        b.set_gpu(request.nv, request.nvccli, request.rocm);
        if request.no_home {
            b.disable_home();
        }
        if let Some(home) = &request.home {
            b.set_home(home)?;
        }
        b.workdir = request.workdir.clone();
        b.cwd = request.pwd.clone();
        b.forward_host_env(&request.host_env);
        for kv in &request.env {
            b.set_env(kv)?;
        }
        if !request.security.is_empty() {
            b.set_security(&request.security)?;
        }
        if let Some(instance) = &request.instance {
            b.set_instance(&instance.name)?;
        }
        b.cgroups_file = request.apply_cgroups.clone();
        b.propagate_umask = !request.no_umask;
        b.writable = request.writable;
        b.writable_tmpfs = request.writable_tmpfs;
        b.contain = request.contain || request.containall;
        if request.containall {
            b.namespaces.pid = true;
            b.namespaces.ipc = true;
            b.clean_env = true;
        }
        b.no_init = request.no_init;
        b.boot = request.boot;
        b.path_var = request.host_var("PATH").map(str::to_string);
        Ok(b)
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn image(&self) -> &Path {
        &self.image
    }

    /// Points the configuration at a different root filesystem.
    pub fn set_image(&mut self, image: impl Into<PathBuf>) {
        self.image = image.into();
    }

    /// Marks `dir` as a temporary directory the starter must remove.
    pub fn set_delete_image_dir(&mut self, dir: impl Into<PathBuf>) {
        self.delete_image_dir = Some(dir.into());
    }

    pub fn set_key(&mut self, key: KeyMaterial) {
        self.key = Some(key);
    }

    pub fn set_writable(&mut self, writable: bool) {
        self.writable = writable;
    }

    pub fn set_writable_tmpfs(&mut self, writable_tmpfs: bool) {
        self.writable_tmpfs = writable_tmpfs;
    }

    pub fn set_gpu(&mut self, nv: bool, nvccli: bool, rocm: bool) {
        self.nv = nv || nvccli;
        self.nvccli = nvccli;
        self.rocm = rocm;
    }

    /// Overrides the subordinate ID files consulted for fakeroot maps.
    pub fn with_subid_files(mut self, subuid: PathBuf, subgid: PathBuf) -> Self {
        self.subid_files = (subuid, subgid);
        self
    }

    /// Adds bind mounts from a comma separated `src[:dest[:ro|rw]]` list.
    pub fn add_binds(&mut self, spec: &str) -> Result<()> {
        self.binds.extend(parse_bind_specs(spec)?);
        Ok(())
    }

    /// Adds capabilities from a comma separated list.
    pub fn add_caps(&mut self, spec: &str) -> Result<()> {
        self.add_caps.extend(parse_capabilities("--add-caps", spec)?);
        Ok(())
    }

    /// Drops capabilities from a comma separated list.
    pub fn drop_caps(&mut self, spec: &str) -> Result<()> {
        self.drop_caps.extend(parse_capabilities("--drop-caps", spec)?);
        Ok(())
    }

    /// Sets the home mount from `src[:dest]`.
    pub fn set_home(&mut self, spec: &str) -> Result<()> {
        self.home = HomeSpec::Custom(parse_home(spec)?);
        Ok(())
    }

    /// Disables home mounting.
    pub fn disable_home(&mut self) {
        self.home = HomeSpec::Disabled;
    }

    /// Sets an environment override from `KEY=VALUE`.
    pub fn set_env(&mut self, kv: &str) -> Result<()> {
        let (key, value) = parse_env(kv)?;
        self.env_explicit.insert(key, value);
        Ok(())
    }

    /// Forwards host variables carrying the forwarding prefix.
    pub fn forward_host_env(&mut self, host_env: &[(String, String)]) {
        for (key, value) in host_env {
            if let Some(stripped) = key.strip_prefix(ENV_FORWARD_PREFIX)
                && !stripped.is_empty()
            {
                self.env_forwarded
                    .insert(stripped.to_string(), value.clone());
            }
        }
    }

    /// Applies `--security` values. Target UID/GID require root.
    pub fn set_security(&mut self, values: &[String]) -> Result<()> {
        for value in values.iter().flat_map(|v| v.split(',')) {
            let value = value.trim();
            if let Some(uid) = value.strip_prefix("uid:") {
                self.target_uid = Some(parse_id("--security", value, uid)?);
            } else if let Some(gids) = value.strip_prefix("gid:") {
                self.target_gids = gids
                    .split(':')
                    .map(|g| parse_id("--security", value, g))
                    .collect::<Result<_>>()?;
            } else {
                return Err(Error::invalid_flag(
                    "--security",
                    value,
                    "supported options are uid:N and gid:N[:N...]",
                ));
            }
        }
        if (self.target_uid.is_some() || !self.target_gids.is_empty()) && !self.probe.is_root() {
            return Err(Error::RequiresRoot {
                feature: "--security uid/gid".to_string(),
            });
        }
        Ok(())
    }

    /// Marks the launch as a named instance.
    pub fn set_instance(&mut self, name: &str) -> Result<()> {
        validate_instance_name(name).map_err(|reason| Error::InvalidInstanceName {
            name: name.to_string(),
            reason: reason.to_string(),
        })?;
        self.instance = Some(name.to_string());
        Ok(())
    }

    /// Applies precedence rules and rejects incompatible combinations.
    pub fn validate(&mut self) -> Result<()> {
        if self.writable && self.writable_tmpfs {
            warn!("--writable and --writable-tmpfs both set, ignoring --writable-tmpfs");
            self.writable_tmpfs = false;
        }

        if self.nv && self.rocm {
            warn!("--nv and --rocm both set, ignoring --rocm");
            self.rocm = false;
        }

        if self.nvccli
            && self.mode
                == (ExecutionMode::Fakeroot {
                    setuid_assisted: true,
                })
        {
            return Err(Error::IncompatibleOptions(
                "--nvccli is not supported with --fakeroot on the setuid workflow".to_string(),
            ));
        }

        if self.nvccli && self.mode.uses_user_namespace() && !self.writable {
            return Err(Error::IncompatibleOptions(
                "--nvccli requires --writable when running in a user namespace".to_string(),
            ));
        }

        Ok(())
    }

    /// Validates, resolves host-dependent settings and seals the
    /// configuration.
    pub fn seal(mut self) -> Result<EngineConfig> {
        self.validate()?;

        let gpu_mode = if self.nvccli {
            GpuMode::NvidiaCli
        } else if self.nv {
            GpuMode::Legacy
        } else if self.rocm {
            GpuMode::Rocm
        } else {
            GpuMode::None
        };
        let gpu = gpu::resolve(gpu_mode, self.host, self.path_var.as_deref())?;

        let home = self.resolve_home();
        let (uid_map, gid_map) = self.id_maps();

        let mut env = self.env_forwarded;
        env.extend(self.env_explicit);

        let mut namespaces = self.namespaces;
        namespaces.user = self.mode.uses_user_namespace();

        let umask = if self.propagate_umask {
            current_umask()
        } else {
            None
        };

        debug!(
            "sealed configuration: mode={}, image={}, binds={}, gpu={}",
            self.mode,
            self.image.display(),
            self.binds.len(),
            gpu.mode
        );

        Ok(EngineConfig {
            mode: self.mode,
            image: self.image,
            delete_image_dir: self.delete_image_dir,
            args: self.args,
            binds: self.binds,
            namespaces,
            add_caps: self.add_caps,
            drop_caps: self.drop_caps,
            gpu,
            key: self.key,
            home,
            workdir: self.workdir,
            cwd: self.cwd,
            env,
            clean_env: self.clean_env,
            instance: self.instance,
            umask,
            writable: self.writable,
            writable_tmpfs: self.writable_tmpfs,
            contain: self.contain,
            no_init: self.no_init,
            boot: self.boot,
            uid_map,
            gid_map,
            target_uid: self.target_uid,
            target_gids: self.target_gids,
            cgroups_file: self.cgroups_file,
        })
    }

    fn resolve_home(&self) -> Option<HomeMount> {
        if let Some(uid) = self.target_uid {
            if uid > HUMAN_UID_THRESHOLD
                && let Some((_, dir)) = passwd_entry(uid)
                && dir.is_dir()
            {
                return Some(HomeMount {
                    source: dir.clone(),
                    dest: dir,
                });
            }
            if uid != 0 {
                debug!("target uid {} has no usable home, disabling home mount", uid);
                return None;
            }
        }

        match &self.home {
            HomeSpec::Custom(mount) => Some(mount.clone()),
            HomeSpec::Disabled => None,
            HomeSpec::Caller if self.contain => None,
            HomeSpec::Caller => passwd_entry(self.probe.uid).map(|(_, dir)| HomeMount {
                source: dir.clone(),
                dest: dir,
            }),
        }
    }

    fn id_maps(&self) -> (Vec<IdMapEntry>, Vec<IdMapEntry>) {
        let (uid, gid) = (self.probe.uid, self.probe.gid);
        match self.mode {
            ExecutionMode::Setuid => (Vec::new(), Vec::new()),
            ExecutionMode::UserNamespace => (vec![identity(uid)], vec![identity(gid)]),
            ExecutionMode::Fakeroot { .. } => {
                let name = passwd_entry(uid).map(|(n, _)| n);
                let mut uid_map = vec![to_root(uid)];
                let mut gid_map = vec![to_root(gid)];
                if let Some(range) = subid_range(&self.subid_files.0, name.as_deref(), uid) {
                    uid_map.push(range);
                }
                if let Some(range) = subid_range(&self.subid_files.1, name.as_deref(), uid) {
                    gid_map.push(range);
                }
                (uid_map, gid_map)
            }
        }
    }
}

fn identity(id: u32) -> IdMapEntry {
    IdMapEntry {
        container_id: id,
        host_id: id,
        size: 1,
    }
}

fn to_root(id: u32) -> IdMapEntry {
    IdMapEntry {
        container_id: 0,
        host_id: id,
        size: 1,
    }
}

fn subid_range(file: &Path, name: Option<&str>, uid: u32) -> Option<IdMapEntry> {
    let content = std::fs::read_to_string(file).ok()?;
    let (start, count) = parse_subid(&content, name, uid)?;
    Some(IdMapEntry {
        container_id: 1,
        host_id: start,
        size: count,
    })
}

/// Finds the first `user:start:count` line for `name` or numeric `uid`.
pub fn parse_subid(content: &str, name: Option<&str>, uid: u32) -> Option<(u32, u32)> {
    let uid_str = uid.to_string();
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .find_map(|line| {
            let mut fields = line.split(':');
            let owner = fields.next()?;
            if owner != uid_str && Some(owner) != name {
                return None;
            }
            let start = fields.next()?.parse().ok()?;
            let count: u32 = fields.next()?.parse().ok()?;
            (count > 0).then_some((start, count))
        })
}

/// Parses a comma separated list of `src[:dest[:ro|rw]]` bind specs.
pub fn parse_bind_specs(spec: &str) -> Result<Vec<BindMount>> {
    spec.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|item| {
            let parts: Vec<&str> = item.split(':').collect();
            let (src, dest, read_only) = match parts.as_slice() {
                [src] => (*src, *src, false),
                [src, dest] => (*src, *dest, false),
                [src, dest, "ro"] => (*src, *dest, true),
                [src, dest, "rw"] => (*src, *dest, false),
                [_, _, opt] => {
                    return Err(Error::invalid_flag(
                        "--bind",
                        item,
                        format!("unknown option '{}', expected ro or rw", opt),
                    ));
                }
                _ => {
                    return Err(Error::invalid_flag(
                        "--bind",
                        item,
                        "expected src[:dest[:ro|rw]]",
                    ));
                }
            };
            if !src.starts_with('/') || !dest.starts_with('/') {
                return Err(Error::invalid_flag(
                    "--bind",
                    item,
                    "source and destination must be absolute paths",
                ));
            }
            Ok(BindMount::new(src, dest, read_only))
        })
        .collect()
}

/// Parses `src[:dest]`; more than two fields is an error.
pub fn parse_home(spec: &str) -> Result<HomeMount> {
    let parts: Vec<&str> = spec.split(':').collect();
    let (source, dest) = match parts.as_slice() {
        [src] => (*src, *src),
        [src, dest] => (*src, *dest),
        _ => {
            return Err(Error::invalid_flag(
                "--home",
                spec,
                "expected src[:dest] with at most two fields",
            ));
        }
    };
    if source.is_empty() || dest.is_empty() {
        return Err(Error::invalid_flag("--home", spec, "empty path"));
    }
    if !dest.starts_with('/') {
        return Err(Error::invalid_flag(
            "--home",
            spec,
            "destination must be an absolute path",
        ));
    }
    Ok(HomeMount {
        source: PathBuf::from(source),
        dest: PathBuf::from(dest),
    })
}

/// Normalizes a comma separated capability list to `CAP_*` names.
pub fn parse_capabilities(flag: &str, spec: &str) -> Result<Vec<String>> {
    spec.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|cap| {
            let upper = cap.to_ascii_uppercase();
            if upper == "ALL" {
                return Ok(upper);
            }
            let name = if upper.starts_with("CAP_") {
                upper
            } else {
                format!("CAP_{}", upper)
            };
            if LINUX_CAPABILITIES.contains(&name.as_str()) {
                Ok(name)
            } else {
                Err(Error::invalid_flag(flag, cap, "unknown capability"))
            }
        })
        .collect()
}

fn parse_env(kv: &str) -> Result<(String, String)> {
    let (key, value) = kv
        .split_once('=')
        .ok_or_else(|| Error::invalid_flag("--env", kv, "expected KEY=VALUE"))?;
    if key.is_empty() || key.contains(char::is_whitespace) {
        return Err(Error::invalid_flag("--env", kv, "invalid variable name"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn parse_id(flag: &str, value: &str, id: &str) -> Result<u32> {
    id.parse()
        .map_err(|_| Error::invalid_flag(flag, value, "not a numeric id"))
}

/// Reads the process umask from `/proc/self/status`.
fn current_umask() -> Option<u32> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    status
        .lines()
        .find_map(|l| l.strip_prefix("Umask:"))
        .and_then(|v| u32::from_str_radix(v.trim(), 8).ok())
}

/// Looks up the user name and home directory for `uid`.
fn passwd_entry(uid: u32) -> Option<(String, PathBuf)> {
    let mut buf = vec![0 as libc::c_char; 16 * 1024];
    // SAFETY: passwd is plain old data, filled in by getpwuid_r.
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    // SAFETY: all pointers reference live buffers of the advertised sizes.
    let rc = unsafe { libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result) };
    if rc != 0 || result.is_null() {
        return None;
    }
    // SAFETY: on success pw_name and pw_dir point into `buf` and are NUL terminated.
    let (name, dir) = unsafe { (CStr::from_ptr(pwd.pw_name), CStr::from_ptr(pwd.pw_dir)) };
    Some((
        name.to_string_lossy().into_owned(),
        PathBuf::from(dir.to_string_lossy().into_owned()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subid_by_name_and_uid() {
        let content = "alice:100000:65536\n1001:200000:1000\n";
        assert_eq!(parse_subid(content, Some("alice"), 1000), Some((100000, 65536)));
        assert_eq!(parse_subid(content, Some("bob"), 1001), Some((200000, 1000)));
        assert_eq!(parse_subid(content, Some("carol"), 1002), None);
    }

    #[test]
    fn test_parse_env_rejects_missing_equals() {
        assert!(parse_env("FOO").is_err());
        assert_eq!(
            parse_env("FOO=a=b").unwrap(),
            ("FOO".to_string(), "a=b".to_string())
        );
    }

    #[test]
    fn test_capability_normalization() {
        let caps = parse_capabilities("--add-caps", "net_raw, CAP_SYS_ADMIN,all").unwrap();
        assert_eq!(caps, vec!["CAP_NET_RAW", "CAP_SYS_ADMIN", "ALL"]);
        assert!(parse_capabilities("--add-caps", "CAP_FLY").is_err());
    }

    #[test]
    fn test_passwd_root() {
        let (name, _) = passwd_entry(0).unwrap();
        assert_eq!(name, "root");
    }
}
