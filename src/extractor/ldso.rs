//! Shared library discovery through the dynamic loader.
//!
//! Runs `<loader> --list <binary>` with an empty environment and turns its
//! output into bind pairs:
//!
//! ```text
//! /lib64/ld-linux-x86-64.so.2 (0x7f...)            → same path both sides
//! libz.so.1 => /usr/lib/glibc-hwcaps/x86-64-v3/libz.so.1.3 (0x7f...)
//!                                                  → src = resolved path
//!                                                    dst = dir(resolved)/libz.so.1
//! linux-vdso.so.1 (0x7ffc...)                      → dropped
//! ```

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// A library that must be visible inside the extractor sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LibraryBind {
    /// Host file.
    pub source: PathBuf,
    /// Path the loader will look for inside the sandbox.
    pub dest: PathBuf,
}

/// Lists the shared libraries `binary` needs, using `loader`.
pub fn list_dependencies(loader: &Path, binary: &Path) -> Result<Vec<LibraryBind>> {
    let output = Command::new(loader)
        .arg("--list")
        .arg(binary)
        .env_clear()
        .output()
        .map_err(|e| Error::LoaderFailed {
            path: binary.to_path_buf(),
            reason: format!("cannot run {}: {}", loader.display(), e),
        })?;

    if !output.status.success() {
        return Err(Error::LoaderFailed {
            path: binary.to_path_buf(),
            reason: format!(
                "{} --list exited with {}: {}",
                loader.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }

    let binds = parse_loader_output(&String::from_utf8_lossy(&output.stdout));
    debug!("{} needs {} libraries", binary.display(), binds.len());
    Ok(binds)
}

/// Parses dependency listing output into library binds.
pub fn parse_loader_output(output: &str) -> Vec<LibraryBind> {
    let mut binds: Vec<LibraryBind> = Vec::new();
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let bind = match line.split_once("=>") {
            Some((name, rest)) => {
                let name = name.trim();
                let resolved = rest.split_whitespace().next().unwrap_or("");
                if !resolved.starts_with('/') {
                    if resolved == "not" {
                        warn!("library {} not found by the loader", name);
                    }
                    continue;
                }
                let source = PathBuf::from(resolved);
                let dest = source
                    .parent()
                    .map(|dir| dir.join(name))
                    .unwrap_or_else(|| source.clone());
                LibraryBind { source, dest }
            }
            None => {
                let path = line.split_whitespace().next().unwrap_or("");
                if !path.starts_with('/') {
                    continue;
                }
                LibraryBind {
                    source: PathBuf::from(path),
                    dest: PathBuf::from(path),
                }
            }
        };
        if !binds.contains(&bind) {
            binds.push(bind);
        }
    }
    binds
}
