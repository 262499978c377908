//! Launch orchestration.
//!
//! One strict sequence per launch:
//!
//! ```text
//! Probe ─► Resolver ─► Builder ─► Preparer ─► seal ─► Handoff
//!                                                      ├─ exec   (foreground)
//!                                                      └─ spawn  (instance) ─► Registry
//! ```
//!
//! Every stage returns its error here; nothing below this module exits the
//! process.

use std::path::PathBuf;

use tracing::debug;

use crate::config::HostConfig;
use crate::encryption::PassphrasePrompt;
use crate::engine::{ConfigBuilder, EngineConfig};
use crate::error::{Error, Result};
use crate::handoff::{MessageLevel, Starter, StarterMessage};
use crate::instance::{self, DetachedLaunch, Instance, InstanceRegistry};
use crate::prepare::{DriverRegistry, ImagePreparer, Preparation};
use crate::probe::CapabilityProbe;
use crate::request::LaunchRequest;
use crate::resolver::{self, ExecutionMode, HostPolicy};

/// Everything decided for a launch, ready for handoff.
#[derive(Debug)]
pub struct LaunchPlan {
    pub mode: ExecutionMode,
    pub config: EngineConfig,
    pub preparation: Preparation,
    pub starter: Starter,
}

/// Drives a launch from request to starter.
pub struct Launcher<'a> {
    host: &'a HostConfig,
    probe: CapabilityProbe,
    drivers: &'a DriverRegistry,
    prompt: &'a dyn PassphrasePrompt,
    level: MessageLevel,
    registry: InstanceRegistry,
    runtime: Option<PathBuf>,
}

impl<'a> Launcher<'a> {
    pub fn new(
        host: &'a HostConfig,
        probe: CapabilityProbe,
        drivers: &'a DriverRegistry,
        prompt: &'a dyn PassphrasePrompt,
    ) -> Self {
        Self {
            host,
            probe,
            drivers,
            prompt,
            level: MessageLevel::default(),
            registry: InstanceRegistry::new(host.instance_root()),
            runtime: None,
        }
    }

    /// Sets the verbosity forwarded to the starter.
    pub fn with_message_level(mut self, level: MessageLevel) -> Self {
        self.level = level;
        self
    }

    /// Uses `runtime` for nested extraction instead of the current executable.
    pub fn with_runtime(mut self, runtime: PathBuf) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn probe(&self) -> &CapabilityProbe {
        &self.probe
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    /// Resolves, builds, prepares and seals a launch without handing it off.
    pub fn plan(&self, request: &LaunchRequest) -> Result<LaunchPlan> {
        let policy = HostPolicy {
            setuid_install: self.host.setuid_support(),
            allow_setuid: self.host.allow_setuid,
        };
        let mode = resolver::resolve(&self.probe, request, policy)?;

        let mut builder = ConfigBuilder::from_request(mode, &self.probe, self.host, request)?;
        builder.validate()?;

        let mut preparer = ImagePreparer::new(self.host, &self.probe, self.drivers, self.prompt);
        if let Some(runtime) = &self.runtime {
            preparer = preparer.with_runtime(runtime.clone());
        }
        let preparation = preparer.prepare(request, &mut builder)?;

        let config = builder.seal()?;
        let starter = Starter::for_mode(mode, self.host, self.level);
        debug!(
            "launch planned: mode={} image={} starter={}",
            mode,
            config.image().display(),
            starter.path().display()
        );
        Ok(LaunchPlan {
            mode,
            config,
            preparation,
            starter,
        })
    }

    /// Runs the request in the foreground by replacing this process with
    /// the starter. Returns only on failure.
    pub fn exec(&self, request: &LaunchRequest) -> Error {
        let plan = match self.plan(request) {
            Ok(plan) => plan,
            Err(e) => return e,
        };
        let message = StarterMessage::new(plan.config.clone());
        // The conversion guard in `plan` stays alive across exec so the
        // sandbox survives for the starter, and is dropped on failure.
        plan.starter.exec(&message)
    }

    /// Starts the request as a named detached instance.
    pub fn start_instance(&self, request: &LaunchRequest) -> Result<Instance> {
        let Some(instance) = &request.instance else {
            return Err(Error::IncompatibleOptions(
                "an instance launch needs an instance name".to_string(),
            ));
        };
        let reservation = self.registry.reserve(&instance.name)?;

        let plan = self.plan(request)?;
        let message = StarterMessage::new(plan.config);
        instance::start_detached(
            DetachedLaunch {
                reservation,
                starter: &plan.starter,
                image: request.image.clone(),
                pid_file: instance.pid_file.clone(),
                conversion: plan.preparation.conversion,
            },
            &message,
        )
    }
}
