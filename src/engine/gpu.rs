//! GPU library, binary and IPC discovery.
//!
//! Legacy NVIDIA and ROCm bindings come from an allow-list file matched
//! against the dynamic linker cache (`ldconfig -p`) and `PATH`. NVIDIA
//! container CLI bindings come from `nvidia-container-cli list`. Results
//! are only recorded; the starter performs the bind mounts.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::HostConfig;
use crate::constants::NVIDIA_IPC_SOCKETS;
use crate::error::{Error, Result};

/// Accelerator binding strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GpuMode {
    #[default]
    None,
    /// NVIDIA driver files bound from an allow-list.
    Legacy,
    /// NVIDIA driver setup delegated to `nvidia-container-cli`.
    NvidiaCli,
    /// ROCm driver files bound from an allow-list.
    Rocm,
}

impl std::fmt::Display for GpuMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Legacy => write!(f, "legacy"),
            Self::NvidiaCli => write!(f, "nvidia-cli"),
            Self::Rocm => write!(f, "rocm"),
        }
    }
}

/// Resolved host paths for the chosen [`GpuMode`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuBindings {
    pub mode: GpuMode,
    pub libraries: Vec<PathBuf>,
    pub binaries: Vec<PathBuf>,
    pub ipcs: Vec<PathBuf>,
    /// `nvidia-container-cli` executable for [`GpuMode::NvidiaCli`].
    pub cli: Option<PathBuf>,
}

/// Resolves bindings for `mode` on this host.
pub fn resolve(mode: GpuMode, host: &HostConfig, path_var: Option<&str>) -> Result<GpuBindings> {
    match mode {
        GpuMode::None => Ok(GpuBindings::default()),
        GpuMode::Legacy => {
            let mut bindings = from_allow_list(mode, &host.nvidia_liblist(), host, path_var)?;
            bindings.ipcs = probe_ipcs(NVIDIA_IPC_SOCKETS);
            Ok(bindings)
        }
        GpuMode::Rocm => from_allow_list(mode, &host.rocm_liblist(), host, path_var),
        GpuMode::NvidiaCli => from_container_cli(host, path_var),
    }
}

fn from_allow_list(
    mode: GpuMode,
    list: &Path,
    host: &HostConfig,
    path_var: Option<&str>,
) -> Result<GpuBindings> {
    let content = match std::fs::read_to_string(list) {
        Ok(c) => c,
        Err(e) => {
            warn!(
                "{} GPU allow-list {} unreadable ({}), no driver files will be bound",
                mode,
                list.display(),
                e
            );
            return Ok(GpuBindings {
                mode,
                ..Default::default()
            });
        }
    };
    let names = parse_allow_list(&content);
    let (lib_names, bin_names): (Vec<&str>, Vec<&str>) = names
        .iter()
        .map(String::as_str)
        .partition(|n| n.contains(".so"));

    let ldconfig = host.resolve_tool(&host.ldconfig, path_var)?;
    let output = Command::new(&ldconfig)
        .arg("-p")
        .env_clear()
        .output()
        .map_err(|e| Error::GpuSetup {
            mode: mode.to_string(),
            reason: format!("cannot run {}: {}", ldconfig.display(), e),
        })?;
    if !output.status.success() {
        return Err(Error::GpuSetup {
            mode: mode.to_string(),
            reason: format!("{} -p exited with {}", ldconfig.display(), output.status),
        });
    }
    let cache = parse_ld_cache(&String::from_utf8_lossy(&output.stdout));
    let libraries = match_libraries(&lib_names, &cache);

    let binaries: Vec<PathBuf> = bin_names
        .iter()
        .filter_map(|name| match host.resolve_tool(Path::new(name), path_var) {
            Ok(p) => Some(p),
            Err(_) => {
                debug!("{} binary {} not found in PATH", mode, name);
                None
            }
        })
        .collect();

    if libraries.is_empty() {
        warn!("could not find any {} GPU libraries on this host", mode);
    }

    Ok(GpuBindings {
        mode,
        libraries,
        binaries,
        ipcs: Vec::new(),
        cli: None,
    })
}

fn from_container_cli(host: &HostConfig, path_var: Option<&str>) -> Result<GpuBindings> {
    let cli = host.resolve_tool(&host.nvidia_container_cli, path_var)?;
    let output = Command::new(&cli)
        .args(["list", "--binaries", "--libraries", "--ipcs"])
        .output()
        .map_err(|e| Error::GpuSetup {
            mode: GpuMode::NvidiaCli.to_string(),
            reason: format!("cannot run {}: {}", cli.display(), e),
        })?;
    if !output.status.success() {
        return Err(Error::GpuSetup {
            mode: GpuMode::NvidiaCli.to_string(),
            reason: format!(
                "{} list failed: {}",
                cli.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }

    let mut bindings = parse_container_cli_list(&String::from_utf8_lossy(&output.stdout));
    bindings.cli = Some(cli);
    Ok(bindings)
}

/// Parses an allow-list: one name per line, `#` comments, blanks ignored.
pub fn parse_allow_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Parses `ldconfig -p` output into `(soname, path)` pairs, keeping only
/// entries for the native word size.
pub fn parse_ld_cache(output: &str) -> Vec<(String, PathBuf)> {
    let native_64 = cfg!(target_pointer_width = "64");
    output
        .lines()
        .filter_map(|line| {
            let (left, path) = line.split_once("=>")?;
            let left = left.trim();
            let (name, flags) = match left.split_once(" (") {
                Some((n, f)) => (n.trim(), f),
                None => (left, ""),
            };
            if native_64 && !flags.is_empty() && !flags.contains("64") {
                return None;
            }
            Some((name.to_string(), PathBuf::from(path.trim())))
        })
        .collect()
}

/// Matches allow-listed library names against the linker cache. A cache
/// entry matches when its soname starts with the allow-listed name; the
/// first path per soname wins.
pub fn match_libraries(names: &[&str], cache: &[(String, PathBuf)]) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut libs = Vec::new();
    for (soname, path) in cache {
        if names.iter().any(|n| soname.starts_with(n)) && seen.insert(soname.clone()) {
            libs.push(path.clone());
        }
    }
    libs
}

/// Classifies `nvidia-container-cli list` output lines.
pub fn parse_container_cli_list(output: &str) -> GpuBindings {
    let mut bindings = GpuBindings {
        mode: GpuMode::NvidiaCli,
        ..Default::default()
    };
    for line in output.lines().map(str::trim).filter(|l| l.starts_with('/')) {
        let path = PathBuf::from(line);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if name.contains(".so") {
            bindings.libraries.push(path);
        } else if line.starts_with("/run/") || line.starts_with("/var/run/") {
            bindings.ipcs.push(path);
        } else {
            bindings.binaries.push(path);
        }
    }
    bindings
}

fn probe_ipcs(candidates: &[&str]) -> Vec<PathBuf> {
    candidates
        .iter()
        .map(PathBuf::from)
        .filter(|p| p.exists())
        .collect()
}
