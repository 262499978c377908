//! Error types for the launch engine.
//!
//! Variants are grouped by the stage that raises them. Every stage returns
//! these errors upward; only the binary's `main` turns one into a process
//! exit status.

use std::path::PathBuf;

/// Result type alias for launch engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad class of an [`Error`], used by the top-level handler for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A privileged feature was requested without the privilege for it.
    PolicyViolation,
    /// Conflicting flags or malformed specifications.
    IncompatibleConfig,
    /// Image inspection, conversion or extraction failed.
    Preparation,
    /// The starter could not be executed or spawned.
    Handoff,
    /// Instance registry bookkeeping failed.
    Instance,
    /// Host configuration or I/O failure outside the categories above.
    Host,
}

/// Errors that can occur while resolving, building, preparing or handing off
/// a container launch.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Policy Violations
    // =========================================================================
    /// A feature needs privileges the caller does not hold.
    #[error("{feature} requires root privileges")]
    RequiresRoot { feature: String },

    /// Generic host policy refusal.
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    // =========================================================================
    // Incompatible Configuration
    // =========================================================================
    /// Two or more requested settings cannot be combined.
    #[error("incompatible options: {0}")]
    IncompatibleOptions(String),

    /// A flag value could not be parsed.
    #[error("invalid value for {flag} '{value}': {reason}")]
    InvalidFlag {
        flag: String,
        value: String,
        reason: String,
    },

    /// Instance name failed validation.
    #[error("invalid instance name '{name}': {reason}")]
    InvalidInstanceName { name: String, reason: String },

    // =========================================================================
    // Image Preparation
    // =========================================================================
    /// Image does not exist or cannot be opened.
    #[error("image {path} not accessible: {reason}")]
    ImageNotFound { path: PathBuf, reason: String },

    /// Image format cannot be used with the resolved workflow.
    #[error("image {path} cannot be used without privileges: {reason}; use `build` to convert it to a SIF or sandbox image")]
    UnsupportedImageFormat { path: PathBuf, reason: String },

    /// SIF container is malformed.
    #[error("invalid SIF image {path}: {reason}")]
    InvalidSif { path: PathBuf, reason: String },

    /// Encrypted image without usable key material.
    #[error("image {path} is encrypted: {reason}")]
    KeyMaterial { path: PathBuf, reason: String },

    /// ELF inspection of the extractor failed.
    #[error("failed to read ELF binary {path}: {reason}")]
    ElfParse { path: PathBuf, reason: String },

    /// Dynamic loader dependency listing failed.
    #[error("failed to resolve shared libraries of {path}: {reason}")]
    LoaderFailed { path: PathBuf, reason: String },

    /// Sandbox directory or bind target could not be created.
    #[error("failed to prepare sandbox at {path}: {reason}")]
    SandboxSetup { path: PathBuf, reason: String },

    /// The extractor ran but did not succeed.
    #[error("failed to extract {image} into {dest}: {reason}")]
    ExtractionFailed {
        image: PathBuf,
        dest: PathBuf,
        reason: String,
    },

    /// GPU library/binary discovery failed.
    #[error("failed to resolve {mode} GPU bindings: {reason}")]
    GpuSetup { mode: String, reason: String },

    /// A required host tool was not found.
    #[error("{tool} not found: {reason}")]
    ToolNotFound { tool: String, reason: String },

    // =========================================================================
    // Handoff
    // =========================================================================
    /// The starter binary could not be executed.
    #[error("failed to execute starter {path}: {source}")]
    StarterExec {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The starter binary could not be spawned.
    #[error("failed to spawn starter {path}: {source}")]
    StarterSpawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The starter payload could not be encoded or delivered.
    #[error("failed to deliver starter payload: {0}")]
    Payload(String),

    // =========================================================================
    // Instances
    // =========================================================================
    /// An instance with this name is already registered.
    #[error("instance {0} already exists")]
    InstanceExists(String),

    /// No instance with this name is registered.
    #[error("instance {0} not found")]
    InstanceNotFound(String),

    /// Instance metadata could not be read or written.
    #[error("instance {name}: {reason}")]
    InstanceState { name: String, reason: String },

    // =========================================================================
    // Host
    // =========================================================================
    /// Host configuration file is invalid.
    #[error("invalid configuration {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Returns the taxonomy class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RequiresRoot { .. } | Self::PolicyViolation(_) => ErrorKind::PolicyViolation,
            Self::IncompatibleOptions(_)
            | Self::InvalidFlag { .. }
            | Self::InvalidInstanceName { .. } => ErrorKind::IncompatibleConfig,
            Self::ImageNotFound { .. }
            | Self::UnsupportedImageFormat { .. }
            | Self::InvalidSif { .. }
            | Self::KeyMaterial { .. }
            | Self::ElfParse { .. }
            | Self::LoaderFailed { .. }
            | Self::SandboxSetup { .. }
            | Self::ExtractionFailed { .. }
            | Self::GpuSetup { .. }
            | Self::ToolNotFound { .. } => ErrorKind::Preparation,
            Self::StarterExec { .. } | Self::StarterSpawn { .. } | Self::Payload(_) => {
                ErrorKind::Handoff
            }
            Self::InstanceExists(_) | Self::InstanceNotFound(_) | Self::InstanceState { .. } => {
                ErrorKind::Instance
            }
            Self::Config { .. } | Self::Io(_) | Self::Serialization(_) => ErrorKind::Host,
        }
    }

    pub(crate) fn invalid_flag(flag: &str, value: &str, reason: impl Into<String>) -> Self {
        Self::InvalidFlag {
            flag: flag.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
