//! # Privilege Handoff
//!
//! Hands a sealed [`EngineConfig`] to the starter, the small trusted binary
//! that performs the namespace and mount work.
//!
//! ## Payload
//!
//! The configuration travels as a versioned [`StarterMessage`] encoded with
//! `serde_json`. It is written into a pipe before the starter runs and the
//! read end is installed as file descriptor [`STARTER_PAYLOAD_FD`]:
//!
//! ```text
//! engine ── write ──► [ pipe ] ── fd 3 ──► starter
//!                                argv[0] = "sifrun-starter"
//!                                SIFRUN_MESSAGELEVEL=<n>
//! ```
//!
//! ## Terminal actions
//!
//! - [`Starter::exec`] replaces the current process. It only returns on
//!   failure, so its return type is the error itself.
//! - [`Starter::spawn`] starts the starter as a detached child for
//!   instances.

use std::fs::File;
use std::io::Write;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::HostConfig;
use crate::constants::{
    ENGINE_NAME, MESSAGE_LEVEL_ENV, STARTER_MESSAGE_VERSION, STARTER_PAYLOAD_FD,
    STARTER_PROCNAME,
};
use crate::engine::EngineConfig;
use crate::error::{Error, Result};
use crate::resolver::ExecutionMode;

// =============================================================================
// Message
// =============================================================================

/// Engine-specific payload. Tagged so new engine kinds can be added without
/// breaking older starters' parsing of the envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "config", rename_all = "snake_case")]
pub enum Engine {
    /// Native container engine.
    Native(EngineConfig),
}

/// Envelope read by the starter on its payload descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StarterMessage {
    /// Schema version, see [`STARTER_MESSAGE_VERSION`].
    pub version: u32,
    /// Engine name.
    pub name: String,
    /// Unique id of this launch.
    pub container_id: String,
    /// Engine payload.
    pub engine: Engine,
}

impl StarterMessage {
    /// Wraps a sealed configuration in a new message.
    pub fn new(config: EngineConfig) -> Self {
        let container_id = match config.instance() {
            Some(name) => name.to_string(),
            None => uuid::Uuid::now_v7().to_string(),
        };
        Self {
            version: STARTER_MESSAGE_VERSION,
            name: ENGINE_NAME.to_string(),
            container_id,
            engine: Engine::Native(config),
        }
    }

    /// Returns the native engine configuration.
    pub fn config(&self) -> &EngineConfig {
        match &self.engine {
            Engine::Native(config) => config,
        }
    }

    /// Serializes the message.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses a message, rejecting unknown schema versions.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let message: Self = serde_json::from_slice(bytes)?;
        if message.version != STARTER_MESSAGE_VERSION {
            return Err(Error::Payload(format!(
                "unsupported message version {} (expected {})",
                message.version, STARTER_MESSAGE_VERSION
            )));
        }
        Ok(message)
    }
}

// =============================================================================
// Verbosity
// =============================================================================

/// Verbosity forwarded to the starter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessageLevel {
    Quiet,
    #[default]
    Normal,
    Verbose,
    Debug,
}

impl MessageLevel {
    /// Value of [`MESSAGE_LEVEL_ENV`].
    pub fn env_value(self) -> &'static str {
        match self {
            Self::Quiet => "-1",
            Self::Normal => "1",
            Self::Verbose => "4",
            Self::Debug => "5",
        }
    }
}

// =============================================================================
// Starter
// =============================================================================

/// Selects the starter binary for `mode`: the setuid starter when the mode
/// needs it and the install ships one, the unprivileged starter otherwise.
pub fn select_starter(mode: ExecutionMode, host: &HostConfig) -> PathBuf {
    if mode.needs_setuid_starter() && host.setuid_support() {
        host.starter_suid.clone()
    } else {
        host.starter.clone()
    }
}

/// A starter binary ready to receive a message.
#[derive(Debug, Clone)]
pub struct Starter {
    path: PathBuf,
    level: MessageLevel,
}

impl Starter {
    pub fn new(path: impl Into<PathBuf>, level: MessageLevel) -> Self {
        Self {
            path: path.into(),
            level,
        }
    }

    /// Starter for `mode` on this host.
    pub fn for_mode(mode: ExecutionMode, host: &HostConfig, level: MessageLevel) -> Self {
        Self::new(select_starter(mode, host), level)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replaces the current process with the starter.
    ///
    /// On success this never returns. The returned value is always the
    /// reason the handoff failed.
    pub fn exec(&self, message: &StarterMessage) -> Error {
        let payload = match PayloadPipe::fill(message) {
            Ok(p) => p,
            Err(e) => return e,
        };
        let mut cmd = self.command(&payload, false);
        info!("executing starter {}", self.path.display());
        let source = cmd.exec();
        Error::StarterExec {
            path: self.path.clone(),
            source,
        }
    }

    /// Spawns the starter in a new session with its output redirected to
    /// `stdout` and `stderr`.
    pub fn spawn(&self, message: &StarterMessage, stdout: File, stderr: File) -> Result<Child> {
        let payload = PayloadPipe::fill(message)?;
        let mut cmd = self.command(&payload, true);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        let child = cmd.spawn().map_err(|source| Error::StarterSpawn {
            path: self.path.clone(),
            source,
        })?;
        info!(
            "spawned starter {} as pid {}",
            self.path.display(),
            child.id()
        );
        Ok(child)
    }

    fn command(&self, payload: &PayloadPipe, detach: bool) -> Command {
        let mut cmd = Command::new(&self.path);
        cmd.arg0(STARTER_PROCNAME)
            .env(MESSAGE_LEVEL_ENV, self.level.env_value());

        let read_fd = payload.read_fd();
        // SAFETY: only async-signal-safe calls (dup2, fcntl, setsid) run
        // between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                if read_fd != STARTER_PAYLOAD_FD
                    && libc::dup2(read_fd, STARTER_PAYLOAD_FD) < 0
                {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::fcntl(STARTER_PAYLOAD_FD, libc::F_SETFD, 0) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if detach && libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        cmd
    }
}

/// Pipe pre-filled with an encoded message. The write end is closed once
/// the payload is written, so the starter sees EOF after the message.
#[derive(Debug)]
struct PayloadPipe {
    read: OwnedFd,
}

impl PayloadPipe {
    fn fill(message: &StarterMessage) -> Result<Self> {
        let payload = message.encode()?;

        let mut fds: [RawFd; 2] = [-1, -1];
        // SAFETY: `fds` is a valid two-element array.
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
            return Err(Error::Payload(format!(
                "pipe: {}",
                std::io::Error::last_os_error()
            )));
        }
        // SAFETY: pipe2 succeeded, both descriptors are open and owned here.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        grow_pipe(&write, payload.len())?;

        let mut writer = File::from(write);
        writer
            .write_all(&payload)
            .map_err(|e| Error::Payload(format!("write: {}", e)))?;
        debug!("wrote {} byte starter payload", payload.len());
        drop(writer);

        Ok(Self { read })
    }

    fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }
}

/// Grows the pipe buffer so `len` bytes can be written without a reader.
fn grow_pipe(fd: &OwnedFd, len: usize) -> Result<()> {
    // SAFETY: F_GETPIPE_SZ on an open pipe descriptor.
    let current = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETPIPE_SZ) };
    if current >= 0 && len <= current as usize {
        return Ok(());
    }
    let wanted = libc::c_int::try_from(len)
        .map_err(|_| Error::Payload(format!("payload of {} bytes is too large", len)))?;
    // SAFETY: F_SETPIPE_SZ on an open pipe descriptor.
    if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETPIPE_SZ, wanted) } < 0 {
        return Err(Error::Payload(format!(
            "payload of {} bytes exceeds the pipe capacity: {}",
            len,
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_levels_ordered() {
        assert!(MessageLevel::Quiet < MessageLevel::Debug);
        assert_eq!(MessageLevel::default().env_value(), "1");
    }

    #[test]
    fn test_select_starter() {
        let host = HostConfig {
            setuid_install: true,
            ..HostConfig::default()
        };
        assert_eq!(select_starter(ExecutionMode::Setuid, &host), host.starter_suid);
        assert_eq!(
            select_starter(ExecutionMode::UserNamespace, &host),
            host.starter
        );
        let no_suid = HostConfig {
            setuid_install: false,
            ..HostConfig::default()
        };
        assert_eq!(
            select_starter(ExecutionMode::Setuid, &no_suid),
            no_suid.starter
        );
    }
}
