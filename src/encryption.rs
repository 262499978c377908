//! Key material for encrypted images.
//!
//! Sources are tried in a fixed order: `--pem-path`, `--passphrase`
//! (interactive prompt), `SIFRUN_ENCRYPTION_PEM_PATH`,
//! `SIFRUN_ENCRYPTION_PASSPHRASE`. The key stays in memory and travels to
//! the starter inside the sealed configuration.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{PASSPHRASE_ENV, PEM_PATH_ENV};
use crate::error::{Error, Result};
use crate::request::LaunchRequest;

/// Decryption key handed to the starter.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeyMaterial {
    /// PEM encoded private key.
    Pem { path: PathBuf, pem: String },
    /// Passphrase.
    Passphrase { passphrase: String },
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pem { path, .. } => f
                .debug_struct("Pem")
                .field("path", path)
                .field("pem", &"<redacted>")
                .finish(),
            Self::Passphrase { .. } => f
                .debug_struct("Passphrase")
                .field("passphrase", &"<redacted>")
                .finish(),
        }
    }
}

/// Source of an interactive passphrase.
pub trait PassphrasePrompt {
    /// Asks the user for a passphrase.
    fn prompt(&self, message: &str) -> std::io::Result<String>;
}

/// Prompts on the controlling terminal with echo disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

impl PassphrasePrompt for TerminalPrompt {
    fn prompt(&self, message: &str) -> std::io::Result<String> {
        let tty = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/tty")?;
        let mut out = &tty;
        write!(out, "{}", message)?;
        out.flush()?;

        let _echo = EchoGuard::disable(&tty);
        let mut line = String::new();
        std::io::BufReader::new(&tty).read_line(&mut line)?;
        writeln!(out)?;
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

/// Restores terminal echo on drop.
struct EchoGuard {
    fd: i32,
    saved: Option<libc::termios>,
}

impl EchoGuard {
    fn disable(tty: &std::fs::File) -> Self {
        use std::os::fd::AsRawFd;
        let fd = tty.as_raw_fd();
        // SAFETY: termios is plain old data; tcgetattr fills it for a valid fd.
        let mut term: libc::termios = unsafe { std::mem::zeroed() };
        // SAFETY: fd refers to an open terminal for the lifetime of the guard.
        if unsafe { libc::tcgetattr(fd, &mut term) } != 0 {
            return Self { fd, saved: None };
        }
        let saved = term;
        term.c_lflag &= !libc::ECHO;
        // SAFETY: same fd, term initialized by tcgetattr above.
        unsafe { libc::tcsetattr(fd, libc::TCSANOW, &term) };
        Self {
            fd,
            saved: Some(saved),
        }
    }
}

impl Drop for EchoGuard {
    fn drop(&mut self) {
        if let Some(saved) = &self.saved {
            // SAFETY: restores the attributes captured in `disable`.
            unsafe { libc::tcsetattr(self.fd, libc::TCSANOW, saved) };
        }
    }
}

/// Resolves key material for the encrypted image at `image`.
pub fn resolve_key(
    image: &Path,
    request: &LaunchRequest,
    prompt: &dyn PassphrasePrompt,
) -> Result<KeyMaterial> {
    if let Some(path) = &request.pem_path {
        debug!("using PEM key from --pem-path");
        return read_pem(image, path);
    }

    if request.passphrase {
        debug!("prompting for passphrase");
        let passphrase = prompt
            .prompt("Enter passphrase for encrypted container: ")
            .map_err(|e| Error::KeyMaterial {
                path: image.to_path_buf(),
                reason: format!("failed to read passphrase: {}", e),
            })?;
        return non_empty_passphrase(image, passphrase);
    }

    if let Some(path) = request.host_var(PEM_PATH_ENV) {
        debug!("using PEM key from {}", PEM_PATH_ENV);
        return read_pem(image, Path::new(path));
    }

    if let Some(passphrase) = request.host_var(PASSPHRASE_ENV) {
        debug!("using passphrase from {}", PASSPHRASE_ENV);
        return non_empty_passphrase(image, passphrase.to_string());
    }

    Err(Error::KeyMaterial {
        path: image.to_path_buf(),
        reason: format!(
            "no key provided; use --pem-path, --passphrase, {} or {}",
            PEM_PATH_ENV, PASSPHRASE_ENV
        ),
    })
}

fn read_pem(image: &Path, path: &Path) -> Result<KeyMaterial> {
    let pem = std::fs::read_to_string(path).map_err(|e| Error::KeyMaterial {
        path: image.to_path_buf(),
        reason: format!("cannot read PEM file {}: {}", path.display(), e),
    })?;
    if !pem.contains("-----BEGIN") || !pem.contains("PRIVATE KEY-----") {
        return Err(Error::KeyMaterial {
            path: image.to_path_buf(),
            reason: format!("{} does not contain a PEM private key", path.display()),
        });
    }
    Ok(KeyMaterial::Pem {
        path: path.to_path_buf(),
        pem,
    })
}

fn non_empty_passphrase(image: &Path, passphrase: String) -> Result<KeyMaterial> {
    if passphrase.is_empty() {
        return Err(Error::KeyMaterial {
            path: image.to_path_buf(),
            reason: "empty passphrase".to_string(),
        });
    }
    Ok(KeyMaterial::Passphrase { passphrase })
}
