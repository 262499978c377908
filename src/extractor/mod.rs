//! # Sandboxed Extractor
//!
//! Unpacks a squashfs archive into a directory without trusting the
//! extraction tool. When the caller is not host root, the extractor runs
//! inside a nested minimal container started by this same binary:
//!
//! ```text
//! <staging>/                          (bound read-write)
//! ├── image.squashfs                  source archive
//! ├── rootfs/                         destination
//! └── .extract-<uuid>/                sandbox root, removed afterwards
//!     ├── dev etc proc sys tmp
//!     ├── usr/bin/unsquashfs          placeholder → bound read-only
//!     ├── lib64/ld-linux-x86-64.so.2  placeholder → bound read-only
//!     └── tmp/sifrun-rootfs-.../      placeholder → staging bind
//! ```
//!
//! Host root (or hosts with sandboxing disabled) run the extractor
//! directly. Libraries are discovered by asking the extractor's own
//! dynamic loader, see [`ldso`].

pub mod elf;
pub mod ldso;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info, warn};

use crate::constants::{ENV_FORWARD_PREFIX, SANDBOX_MINIMAL_DIRS};
use crate::engine::BindMount;
use crate::error::{Error, Result};

pub use ldso::LibraryBind;

/// Maximum number of bytes of extractor stderr carried in an error.
const STDERR_TAIL: usize = 2048;

/// How the extractor process is run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionMode {
    /// Run the extractor directly on the host.
    Direct,
    /// Re-invoke `runtime` to run the extractor in a minimal container.
    Sandboxed { runtime: PathBuf },
}

/// Squashfs extraction driver.
#[derive(Debug, Clone)]
pub struct Extractor {
    tool: PathBuf,
    mode: ExtractionMode,
}

impl Extractor {
    /// Creates an extractor that runs `tool` according to `mode`.
    pub fn new(tool: PathBuf, mode: ExtractionMode) -> Self {
        Self { tool, mode }
    }

    /// Returns the extraction tool path.
    pub fn tool(&self) -> &Path {
        &self.tool
    }

    /// Returns the execution mode.
    pub fn mode(&self) -> &ExtractionMode {
        &self.mode
    }

    /// Extracts `source` into `dest`. `dest` must not exist yet; its parent
    /// is the staging directory shared with the sandbox. `files` restricts
    /// extraction to the named archive paths.
    pub fn extract(&self, source: &Path, dest: &Path, files: &[String]) -> Result<()> {
        let staging = dest.parent().ok_or_else(|| Error::SandboxSetup {
            path: dest.to_path_buf(),
            reason: "destination has no parent directory".to_string(),
        })?;

        let command = match &self.mode {
            ExtractionMode::Direct => {
                debug!("extracting {} directly", source.display());
                let mut cmd = Command::new(&self.tool);
                cmd.args(extractor_args(source, dest, files));
                cmd
            }
            ExtractionMode::Sandboxed { runtime } => {
                let sandbox = SandboxRoot::create(staging)?;
                let cmd = self.sandboxed_command(runtime, &sandbox, source, dest, files)?;
                return run(cmd, source, dest);
            }
        };
        run(command, source, dest)
    }

    fn sandboxed_command(
        &self,
        runtime: &Path,
        sandbox: &SandboxRoot,
        source: &Path,
        dest: &Path,
        files: &[String],
    ) -> Result<Command> {
        let staging = sandbox.staging();
        let interp = elf::interpreter(&self.tool)?;
        let libraries = match &interp {
            Some(loader) => ldso::list_dependencies(loader, &self.tool)?,
            None => {
                debug!("{} is statically linked", self.tool.display());
                Vec::new()
            }
        };

        let mut binds = vec![BindMount::new(self.tool.clone(), self.tool.clone(), true)];
        binds.extend(
            libraries
                .iter()
                .map(|lib| BindMount::new(lib.source.clone(), lib.dest.clone(), true)),
        );
        binds.push(BindMount::new(
            staging.to_path_buf(),
            staging.to_path_buf(),
            false,
        ));
        if !source.starts_with(staging) {
            binds.push(BindMount::new(
                source.to_path_buf(),
                source.to_path_buf(),
                true,
            ));
        }

        for bind in &binds {
            sandbox.add_placeholder(&bind.dest, bind.source.is_dir())?;
        }

        let args = nested_args(sandbox.path(), &self.tool, &binds, source, dest, files);
        debug!(
            "sandboxed extraction via {} with {} binds",
            runtime.display(),
            binds.len()
        );

        let mut cmd = Command::new(runtime);
        cmd.args(args);
        let lib_var = format!("{}LD_LIBRARY_PATH", ENV_FORWARD_PREFIX);
        let lib_dirs = library_path(&libraries);
        if lib_dirs.is_empty() {
            cmd.env_remove(lib_var);
        } else {
            cmd.env(lib_var, lib_dirs);
        }
        Ok(cmd)
    }
}

fn run(mut command: Command, source: &Path, dest: &Path) -> Result<()> {
    let output = command.output().map_err(|e| Error::ExtractionFailed {
        image: source.to_path_buf(),
        dest: dest.to_path_buf(),
        reason: format!("cannot run {:?}: {}", command.get_program(), e),
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail_start = stderr.len().saturating_sub(STDERR_TAIL);
        let tail = stderr
            .char_indices()
            .find(|(i, _)| *i >= tail_start)
            .map(|(i, _)| &stderr[i..])
            .unwrap_or("");
        return Err(Error::ExtractionFailed {
            image: source.to_path_buf(),
            dest: dest.to_path_buf(),
            reason: format!("extractor exited with {}: {}", output.status, tail.trim()),
        });
    }

    info!("extracted {} into {}", source.display(), dest.display());
    Ok(())
}

/// Extractor arguments: force, destination, archive, then optional files.
pub fn extractor_args(source: &Path, dest: &Path, files: &[String]) -> Vec<String> {
    let mut args = vec![
        "-f".to_string(),
        "-d".to_string(),
        dest.display().to_string(),
        source.display().to_string(),
    ];
    args.extend(files.iter().cloned());
    args
}

/// Arguments for re-invoking the runtime as a minimal, isolated container
/// around the extractor.
pub fn nested_args(
    sandbox_root: &Path,
    tool: &Path,
    binds: &[BindMount],
    source: &Path,
    dest: &Path,
    files: &[String],
) -> Vec<String> {
    let mut args: Vec<String> = [
        "exec",
        "--contain",
        "--no-home",
        "--no-nv",
        "--no-rocm",
        "-C",
        "--no-init",
        "--writable",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    if !binds.is_empty() {
        args.push("-B".to_string());
        args.push(
            binds
                .iter()
                .map(BindMount::to_spec)
                .collect::<Vec<_>>()
                .join(","),
        );
    }

    args.push(sandbox_root.display().to_string());
    args.push(tool.display().to_string());
    args.extend(extractor_args(source, dest, files));
    args
}

/// Colon-joined unique directories of the library destinations.
pub fn library_path(libraries: &[LibraryBind]) -> String {
    let mut dirs: Vec<String> = Vec::new();
    for dir in libraries.iter().filter_map(|l| l.dest.parent()) {
        let dir = dir.display().to_string();
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    }
    dirs.join(":")
}

// =============================================================================
// Sandbox root
// =============================================================================

/// Temporary root filesystem for the nested extractor container. Removed
/// on drop, whatever the extraction outcome.
#[derive(Debug)]
pub struct SandboxRoot {
    path: PathBuf,
    staging: PathBuf,
}

impl SandboxRoot {
    /// Creates `<staging>/.extract-<uuid>` with the minimal directory set.
    pub fn create(staging: &Path) -> Result<Self> {
        let path = staging.join(format!(".extract-{}", uuid::Uuid::now_v7()));
        let setup_err = |e: std::io::Error| Error::SandboxSetup {
            path: path.clone(),
            reason: e.to_string(),
        };
        fs::create_dir(&path).map_err(setup_err)?;
        let root = Self {
            path: path.clone(),
            staging: staging.to_path_buf(),
        };
        for dir in SANDBOX_MINIMAL_DIRS {
            fs::create_dir_all(path.join(dir)).map_err(setup_err)?;
        }
        Ok(root)
    }

    /// Root directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Staging directory the root lives in.
    pub fn staging(&self) -> &Path {
        &self.staging
    }

    /// Creates an empty mount target for `dest` inside the root: a directory
    /// when `dir` is set, otherwise a zero-length file.
    pub fn add_placeholder(&self, dest: &Path, dir: bool) -> Result<PathBuf> {
        let rel = dest.strip_prefix("/").unwrap_or(dest);
        let target = self.path.join(rel);
        let setup_err = |e: std::io::Error| Error::SandboxSetup {
            path: target.clone(),
            reason: e.to_string(),
        };

        if dir {
            fs::create_dir_all(&target).map_err(setup_err)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(setup_err)?;
            }
            fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&target)
                .map_err(setup_err)?;
        }
        Ok(target)
    }
}

impl Drop for SandboxRoot {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            warn!(
                "failed to remove extractor sandbox {}: {}",
                self.path.display(),
                e
            );
        }
    }
}
