//! # sifrun
//!
//! **Launch decision engine for an HPC container runtime**
//!
//! This crate decides how a container launch is carried out and hands the
//! result to a separately built, trusted starter binary. It performs no
//! namespace or mount syscalls of its own: it probes the caller, picks an
//! execution workflow, builds a sealed configuration, prepares the image,
//! and replaces itself with (or spawns) the starter.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                              sifrun                                 │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  CapabilityProbe ──► Resolver ──► ConfigBuilder ──► EngineConfig    │
//! │   uid, userns,       Setuid /       binds, GPU,        (sealed)     │
//! │   CapEff             UserNamespace  home, env,            │         │
//! │                      / Fakeroot     id maps               │         │
//! │                                        ▲                  ▼         │
//! │                          ┌─────────────┴───────┐   ┌────────────┐   │
//! │                          │    ImagePreparer    │   │  Handoff   │   │
//! │                          │ SIF / squashfs /    │   │ exec/spawn │   │
//! │                          │ ext3 / sandbox      │   │ fd 3 JSON  │   │
//! │                          └─────────┬───────────┘   └─────┬──────┘   │
//! │                                    ▼                     ▼          │
//! │                          ┌─────────────────────┐  ┌─────────────┐   │
//! │                          │ Sandboxed Extractor │  │  Instance   │   │
//! │                          │ nested unsquashfs   │  │  Registry   │   │
//! │                          └─────────────────────┘  └─────────────┘   │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Execution Workflows
//!
//! | Mode            | Privilege source            | Image handling             |
//! |-----------------|-----------------------------|----------------------------|
//! | `Setuid`        | setuid-installed starter    | single-file images mounted |
//! | `UserNamespace` | unprivileged user namespace | converted to a sandbox     |
//! | `Fakeroot`      | extended subuid/subgid map  | converted to a sandbox     |
//!
//! ## Key Security Properties
//!
//! - **Mode safety**: the resolver never selects a mode needing a privilege
//!   the probe did not confirm (see [`resolver::resolve`]).
//! - **Untrusted extraction**: squashfs extraction by unprivileged callers
//!   runs in a nested container holding only the extractor and its
//!   libraries (see [`extractor`]).
//! - **Sealed configuration**: [`EngineConfig`] has no setters once built.
//! - **Atomic instance names**: two launches cannot claim one name
//!   (see [`instance::InstanceRegistry::reserve`]).
//!
//! # Example
//!
//! ```rust,ignore
//! use sifrun::{CapabilityProbe, DriverRegistry, HostConfig, LaunchRequest, Launcher, TerminalPrompt};
//!
//! fn main() -> sifrun::Result<()> {
//!     let probe = CapabilityProbe::detect();
//!     let host = HostConfig::load(&probe)?;
//!     let drivers = DriverRegistry::new();
//!     let launcher = Launcher::new(&host, probe, &drivers, &TerminalPrompt);
//!     let request = LaunchRequest::new("alpine.sif", vec!["/bin/sh".into()]);
//!     Err(launcher.exec(&request))
//! }
//! ```

pub mod config;
pub mod constants;
pub mod encryption;
pub mod engine;
pub mod error;
pub mod extractor;
pub mod handoff;
pub mod image;
pub mod instance;
pub mod launcher;
pub mod prepare;
pub mod probe;
pub mod request;
pub mod resolver;

// Re-exports
pub use config::HostConfig;
pub use encryption::{KeyMaterial, PassphrasePrompt, TerminalPrompt};
pub use engine::{BindMount, ConfigBuilder, EngineConfig, GpuMode};
pub use error::{Error, ErrorKind, Result};
pub use handoff::{MessageLevel, Starter, StarterMessage};
pub use image::{Image, ImageFormat};
pub use instance::{Instance, InstanceRegistry};
pub use launcher::{LaunchPlan, Launcher};
pub use prepare::{DriverRegistry, ImageDriver, PrepareState, SandboxConversion};
pub use probe::{CapabilityProbe, CapabilitySet};
pub use request::{InstanceRequest, LaunchRequest, NamespaceRequest};
pub use resolver::{ExecutionMode, HostPolicy};
