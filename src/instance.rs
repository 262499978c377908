//! # Instance Lifecycle Tracker
//!
//! Detached launches are recorded in a per-user registry so later commands
//! can list and stop them:
//!
//! ```text
//! ~/.sifrun/instances/
//! └── <name>/
//!     ├── instance.json   pid, image, mode, logs, sandbox dir
//!     ├── stdout.log      starter stdout
//!     └── stderr.log      starter stderr
//! ```
//!
//! A name is reserved by creating its directory, which fails atomically if
//! another launch already holds it. The reservation is released when the
//! launch fails before the record is committed.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::constants::{validate_instance_name, INSTANCE_GRACE_PERIOD};
use crate::error::{Error, Result};
use crate::handoff::{Starter, StarterMessage};
use crate::prepare::SandboxConversion;
use crate::resolver::ExecutionMode;

const RECORD_FILE: &str = "instance.json";
const STDOUT_LOG: &str = "stdout.log";
const STDERR_LOG: &str = "stderr.log";

// =============================================================================
// Record
// =============================================================================

/// On-disk record of a running instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    pub pid: u32,
    /// Image the instance was started from, as the user named it.
    pub image: PathBuf,
    pub mode: ExecutionMode,
    pub user_namespace: bool,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
    pub pid_file: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    /// Temporary sandbox to delete when the instance is removed.
    pub sandbox_dir: Option<PathBuf>,
}

// =============================================================================
// Registry
// =============================================================================

/// Directory of instance records.
#[derive(Debug, Clone)]
pub struct InstanceRegistry {
    root: PathBuf,
}

impl InstanceRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns true if `name` is already registered or reserved.
    pub fn contains(&self, name: &str) -> bool {
        validate_instance_name(name).is_ok() && self.root.join(name).exists()
    }

    /// Reserves `name`. Fails with [`Error::InstanceExists`] if it is taken.
    pub fn reserve(&self, name: &str) -> Result<Reservation> {
        check_name(name)?;
        fs::create_dir_all(&self.root).map_err(|e| Error::InstanceState {
            name: name.to_string(),
            reason: format!("cannot create {}: {}", self.root.display(), e),
        })?;

        let dir = self.root.join(name);
        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(Error::InstanceExists(name.to_string()));
            }
            Err(e) => {
                return Err(Error::InstanceState {
                    name: name.to_string(),
                    reason: format!("cannot create {}: {}", dir.display(), e),
                });
            }
        }
        debug!("reserved instance {} at {}", name, dir.display());
        Ok(Reservation {
            name: name.to_string(),
            dir,
            committed: false,
        })
    }

    /// Reads the record of `name`.
    pub fn get(&self, name: &str) -> Result<Instance> {
        check_name(name)?;
        let path = self.root.join(name).join(RECORD_FILE);
        let data = match fs::read(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::InstanceNotFound(name.to_string()));
            }
            Err(e) => {
                return Err(Error::InstanceState {
                    name: name.to_string(),
                    reason: format!("cannot read {}: {}", path.display(), e),
                });
            }
        };
        serde_json::from_slice(&data).map_err(|e| Error::InstanceState {
            name: name.to_string(),
            reason: format!("corrupt record {}: {}", path.display(), e),
        })
    }

    /// Lists committed instances sorted by name. Reservations without a
    /// record and unreadable records are skipped.
    pub fn list(&self) -> Result<Vec<Instance>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut instances = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            match self.get(&name) {
                Ok(instance) => instances.push(instance),
                Err(e) => debug!("skipping {}: {}", name, e),
            }
        }
        instances.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(instances)
    }

    /// Removes the record of `name` along with its logs and its temporary
    /// sandbox, if any. The process itself is not signalled.
    pub fn remove(&self, name: &str) -> Result<Instance> {
        let instance = self.get(name)?;
        if let Some(sandbox) = &instance.sandbox_dir
            && let Err(e) = fs::remove_dir_all(sandbox)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(
                "failed to remove sandbox {} of instance {}: {}",
                sandbox.display(),
                name,
                e
            );
        }
        if let Some(pid_file) = &instance.pid_file {
            let _ = fs::remove_file(pid_file);
        }
        fs::remove_dir_all(self.root.join(name)).map_err(|e| Error::InstanceState {
            name: name.to_string(),
            reason: format!("cannot remove record: {}", e),
        })?;
        info!("removed instance {}", name);
        Ok(instance)
    }
}

fn check_name(name: &str) -> Result<()> {
    validate_instance_name(name).map_err(|reason| Error::InvalidInstanceName {
        name: name.to_string(),
        reason: reason.to_string(),
    })
}

// =============================================================================
// Reservation
// =============================================================================

/// A claimed instance name. Dropping an uncommitted reservation removes its
/// directory and any logs in it.
#[derive(Debug)]
pub struct Reservation {
    name: String,
    dir: PathBuf,
    committed: bool,
}

impl Reservation {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stdout_log(&self) -> PathBuf {
        self.dir.join(STDOUT_LOG)
    }

    pub fn stderr_log(&self) -> PathBuf {
        self.dir.join(STDERR_LOG)
    }

    /// Creates fresh log files for the starter.
    pub fn open_logs(&self) -> Result<(File, File)> {
        let open = |path: PathBuf| {
            OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&path)
                .map_err(|e| Error::InstanceState {
                    name: self.name.clone(),
                    reason: format!("cannot create {}: {}", path.display(), e),
                })
        };
        Ok((open(self.stdout_log())?, open(self.stderr_log())?))
    }

    /// Writes the record and keeps the directory.
    ///
    /// The record is written to a temporary file and renamed into place.
    /// If that fails it is written in place instead. If no record could be
    /// written the reservation is released on return, so the name is free
    /// again.
    pub fn commit(mut self, instance: &Instance) -> Result<()> {
        let data = serde_json::to_vec_pretty(instance)?;
        let record = self.dir.join(RECORD_FILE);
        let tmp = self.dir.join(format!(".{}.tmp", RECORD_FILE));

        if let Err(e) = fs::write(&tmp, &data).and_then(|()| fs::rename(&tmp, &record)) {
            warn!(
                "cannot write {} atomically ({}), writing in place",
                record.display(),
                e
            );
            let _ = fs::remove_file(&tmp);
            fs::write(&record, &data).map_err(|e| Error::InstanceState {
                name: self.name.clone(),
                reason: format!("cannot write {}: {}", record.display(), e),
            })?;
        }

        self.committed = true;
        debug!("committed instance record {}", self.name);
        Ok(())
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        debug!("releasing instance reservation {}", self.name);
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            warn!(
                "failed to release instance reservation {}: {}",
                self.dir.display(),
                e
            );
        }
    }
}

// =============================================================================
// Detached launch
// =============================================================================

/// What a detached launch needs besides the message.
#[derive(Debug)]
pub struct DetachedLaunch<'a> {
    pub reservation: Reservation,
    pub starter: &'a Starter,
    pub image: PathBuf,
    pub pid_file: Option<PathBuf>,
    pub conversion: Option<SandboxConversion>,
}

/// Spawns the starter for an instance and records it.
///
/// Only a failed spawn fails the launch. Anything the starter writes to
/// stderr within [`INSTANCE_GRACE_PERIOD`] is echoed as a warning, and
/// pid file or record write failures are reported as warnings too.
pub fn start_detached(launch: DetachedLaunch<'_>, message: &StarterMessage) -> Result<Instance> {
    let DetachedLaunch {
        reservation,
        starter,
        image,
        pid_file,
        conversion,
    } = launch;

    let (stdout, stderr) = reservation.open_logs()?;
    let child = starter.spawn(message, stdout, stderr)?;
    let pid = child.id();
    let sandbox_dir = conversion.map(SandboxConversion::persist);

    std::thread::sleep(INSTANCE_GRACE_PERIOD);
    echo_early_errors(reservation.name(), &reservation.stderr_log());

    if let Some(path) = &pid_file
        && let Err(e) = write_pid_file(path, pid)
    {
        warn!("failed to write pid file {}: {}", path.display(), e);
    }

    let config = message.config();
    let instance = Instance {
        name: reservation.name().to_string(),
        pid,
        image,
        mode: config.mode(),
        user_namespace: config.namespaces().user,
        stdout_log: reservation.stdout_log(),
        stderr_log: reservation.stderr_log(),
        pid_file,
        created_at: Utc::now(),
        sandbox_dir,
    };
    if let Err(e) = reservation.commit(&instance) {
        warn!(
            "failed to record instance {}: {}; pid {} keeps running untracked",
            instance.name, e, pid
        );
        if let Some(sandbox) = &instance.sandbox_dir {
            warn!("sandbox {} must be removed by hand", sandbox.display());
        }
    }
    info!("instance {} started with pid {}", instance.name, pid);
    Ok(instance)
}

fn echo_early_errors(name: &str, stderr_log: &Path) {
    match fs::read_to_string(stderr_log) {
        Ok(content) => {
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                warn!("instance {}: {}", name, line);
            }
        }
        Err(e) => debug!("cannot read {}: {}", stderr_log.display(), e),
    }
}

fn write_pid_file(path: &Path, pid: u32) -> io::Result<()> {
    let mut f = File::create(path)?;
    writeln!(f, "{}", pid)
}
