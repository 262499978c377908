//! End-to-end launch planning and instance starts.
//!
//! Foreground launches are only planned here; handing off would replace
//! the test process.

mod common;

use std::fs;

use common::*;
use sifrun::constants::CONVERSION_DIR_PREFIX;
use sifrun::{
    DriverRegistry, Error, ErrorKind, ExecutionMode, HostConfig, InstanceRequest, LaunchRequest,
    Launcher, PassphrasePrompt, PrepareState,
};
use tempfile::TempDir;

struct NoPrompt;

impl PassphrasePrompt for NoPrompt {
    fn prompt(&self, _message: &str) -> std::io::Result<String> {
        Err(std::io::Error::other("no terminal"))
    }
}

struct Fixture {
    tmp: TempDir,
    host: HostConfig,
    drivers: DriverRegistry,
}

impl Fixture {
    fn new(setuid_install: bool) -> Self {
        let tmp = TempDir::new().unwrap();
        let mut host = host_config(tmp.path(), &stub_extractor(tmp.path()));
        host.setuid_install = setuid_install;
        host.starter = stub_starter(tmp.path());
        Self {
            tmp,
            host,
            drivers: DriverRegistry::new(),
        }
    }

    fn launcher(&self) -> Launcher<'_> {
        Launcher::new(&self.host, user_probe(), &self.drivers, &NoPrompt)
    }

    fn sif(&self) -> std::path::PathBuf {
        write_file(
            &self.tmp.path().join("alpine.sif"),
            &sif_bytes(FS_SQUASHFS, &squashfs_bytes()),
        )
    }

    fn conversions(&self) -> Vec<std::path::PathBuf> {
        entries_with_prefix(&self.host.temp_dir, CONVERSION_DIR_PREFIX)
    }
}

fn instance_request(image: &std::path::Path, name: &str) -> LaunchRequest {
    let mut req = LaunchRequest::new(image, vec![]);
    req.instance = Some(InstanceRequest {
        name: name.to_string(),
        pid_file: None,
    });
    req
}

// =============================================================================
// Foreground Planning
// =============================================================================

#[test]
fn test_setuid_install_uses_image_directly() {
    let fx = Fixture::new(true);
    let sif = fx.sif();
    let plan = fx
        .launcher()
        .plan(&LaunchRequest::new(&sif, vec!["/bin/true".into()]))
        .unwrap();

    assert_eq!(plan.mode, ExecutionMode::Setuid);
    assert_eq!(plan.preparation.state, PrepareState::Direct);
    assert!(plan.preparation.conversion.is_none());
    assert_eq!(plan.config.image(), sif.canonicalize().unwrap());
    assert_eq!(plan.starter.path(), fx.host.starter_suid);
    assert!(fx.conversions().is_empty());
}

#[test]
fn test_no_setuid_install_converts() {
    let fx = Fixture::new(false);
    let sif = fx.sif();
    let before = fs::read(&sif).unwrap();
    let plan = fx
        .launcher()
        .plan(&LaunchRequest::new(&sif, vec!["/bin/true".into()]))
        .unwrap();

    assert_eq!(plan.mode, ExecutionMode::UserNamespace);
    assert_eq!(plan.preparation.state, PrepareState::Converted);
    assert_eq!(fx.conversions().len(), 1);
    assert!(plan.config.image().starts_with(&fx.host.temp_dir));
    assert!(plan.config.image_is_deletable());
    assert_eq!(plan.starter.path(), fx.host.starter);
    assert_eq!(fs::read(&sif).unwrap(), before);

    drop(plan);
    assert!(fx.conversions().is_empty());
}

#[test]
fn test_sandboxed_conversion_uses_given_runtime() {
    let mut fx = Fixture::new(false);
    fx.host.unsquashfs = fs::canonicalize("/bin/sh").unwrap();
    fx.host.sandboxed_extraction = true;
    let sif = fx.sif();
    let runtime = stub_runtime(fx.tmp.path());

    let launcher = fx.launcher().with_runtime(runtime);
    let plan = launcher
        .plan(&LaunchRequest::new(&sif, vec!["/bin/true".into()]))
        .unwrap();
    assert_eq!(plan.preparation.state, PrepareState::Converted);
    assert!(plan.config.image().join("archive").is_file());
    drop(plan);
    drop(launcher);

    let launcher = fx.launcher().with_runtime(failing_runtime(fx.tmp.path()));
    let err = launcher
        .plan(&LaunchRequest::new(&sif, vec!["/bin/true".into()]))
        .unwrap_err();
    assert!(matches!(err, Error::ExtractionFailed { .. }));
    assert!(fx.conversions().is_empty());
}

#[test]
fn test_fakeroot_with_nvccli_rejected_before_handoff() {
    let fx = Fixture::new(true);
    let sif = fx.sif();
    let mut req = instance_request(&sif, "gpu");
    req.fakeroot = true;
    req.nv = true;
    req.nvccli = true;

    let launcher = fx.launcher();
    let err = launcher.plan(&req).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IncompatibleConfig);

    let err = launcher.start_instance(&req).unwrap_err();
    assert!(matches!(err, Error::IncompatibleOptions(_)));
    assert!(!launcher.registry().contains("gpu"));
    assert!(fx.conversions().is_empty());
}

#[test]
fn test_foreground_exec_reports_plan_errors() {
    let fx = Fixture::new(true);
    let req = LaunchRequest::new(fx.tmp.path().join("missing.sif"), vec![]);
    let err = fx.launcher().exec(&req);
    assert!(matches!(err, Error::ImageNotFound { .. }));
}

// =============================================================================
// Instances
// =============================================================================

#[test]
fn test_start_instance_in_userns() {
    let fx = Fixture::new(false);
    let sif = fx.sif();
    let mut req = instance_request(&sif, "web");
    req.instance.as_mut().unwrap().pid_file = Some(fx.tmp.path().join("web.pid"));

    let launcher = fx.launcher();
    let instance = launcher.start_instance(&req).unwrap();

    assert_eq!(instance.name, "web");
    assert_eq!(instance.image, sif);
    assert_eq!(instance.mode, ExecutionMode::UserNamespace);
    let sandbox = instance.sandbox_dir.clone().unwrap();
    assert!(sandbox.join("rootfs").is_dir(), "sandbox kept for the instance");
    assert_eq!(launcher.registry().list().unwrap(), vec![instance.clone()]);

    launcher.registry().remove("web").unwrap();
    assert!(!sandbox.exists());
    assert!(!fx.tmp.path().join("web.pid").exists());
}

#[test]
fn test_existing_instance_name_rejected() {
    let fx = Fixture::new(false);
    let sif = fx.sif();
    let launcher = fx.launcher();
    let first = launcher.start_instance(&instance_request(&sif, "web")).unwrap();
    let dir = first.stdout_log.parent().unwrap().to_path_buf();
    let files_before = entries_with_prefix(&dir, "");
    let conversions_before = fx.conversions();

    let err = launcher
        .start_instance(&instance_request(&sif, "web"))
        .unwrap_err();
    assert!(matches!(err, Error::InstanceExists(ref n) if n == "web"));
    assert_eq!(err.kind(), ErrorKind::Instance);

    assert_eq!(launcher.registry().get("web").unwrap(), first);
    assert_eq!(entries_with_prefix(&dir, "").len(), files_before.len(), "no new log files");
    assert_eq!(fx.conversions(), conversions_before, "no new conversion");
}

#[test]
fn test_instance_launch_needs_name() {
    let fx = Fixture::new(true);
    let sif = fx.sif();
    let err = fx
        .launcher()
        .start_instance(&LaunchRequest::new(&sif, vec![]))
        .unwrap_err();
    assert!(matches!(err, Error::IncompatibleOptions(_)));
}

#[test]
fn test_failed_instance_plan_releases_name() {
    let fx = Fixture::new(false);
    let img = write_file(&fx.tmp.path().join("old.img"), &ext3_bytes());
    let launcher = fx.launcher();

    let err = launcher.start_instance(&instance_request(&img, "db")).unwrap_err();
    assert!(matches!(err, Error::UnsupportedImageFormat { .. }));
    assert!(!launcher.registry().contains("db"));
}
