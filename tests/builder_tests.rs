//! Tests for the configuration builder.
//!
//! Covers precedence warnings, rejected combinations, flag parsing, home
//! resolution, ID maps and environment merging.

mod common;

use std::path::{Path, PathBuf};

use common::*;
use sifrun::engine::builder::{parse_bind_specs, parse_capabilities, parse_home, parse_subid};
use sifrun::engine::{GpuMode, IdMapEntry};
use sifrun::{ConfigBuilder, Error, ErrorKind, ExecutionMode, HostConfig, LaunchRequest};
use tempfile::TempDir;

fn host() -> HostConfig {
    HostConfig {
        mount_home: false,
        ..HostConfig::default()
    }
}

fn request() -> LaunchRequest {
    LaunchRequest::new("/images/alpine.sif", vec!["/bin/sh".into()])
}

// =============================================================================
// Validation
// =============================================================================

#[test]
fn test_writable_wins_over_writable_tmpfs() {
    let (probe, host) = (user_probe(), host());
    let mut req = request();
    req.writable = true;
    req.writable_tmpfs = true;
    let cfg = ConfigBuilder::from_request(ExecutionMode::Setuid, &probe, &host, &req)
        .unwrap()
        .seal()
        .unwrap();
    assert!(cfg.writable());
    assert!(!cfg.writable_tmpfs());
}

#[test]
fn test_nv_and_rocm_keeps_nv() {
    let (probe, host) = (user_probe(), host());
    let mut b = ConfigBuilder::new(ExecutionMode::Setuid, &probe, &host, "/img.sif");
    b.set_gpu(true, false, true);
    b.validate().unwrap();
    // validate is idempotent once the conflict is resolved
    b.validate().unwrap();
}

#[test]
fn test_nvccli_in_userns_requires_writable() {
    let (probe, host) = (user_probe(), host());
    let mut b = ConfigBuilder::new(ExecutionMode::UserNamespace, &probe, &host, "/img");
    b.set_gpu(false, true, false);
    let err = b.validate().unwrap_err();
    assert!(matches!(err, Error::IncompatibleOptions(_)));

    b.set_writable(true);
    b.validate().unwrap();
}

#[test]
fn test_nvccli_with_assisted_fakeroot_rejected() {
    let (probe, host) = (user_probe(), host());
    let mode = ExecutionMode::Fakeroot {
        setuid_assisted: true,
    };
    let mut b = ConfigBuilder::new(mode, &probe, &host, "/img");
    b.set_gpu(false, true, false);
    b.set_writable(true);
    let err = b.validate().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IncompatibleConfig);
}

#[test]
fn test_home_with_three_fields_rejected() {
    let (probe, host) = (user_probe(), host());
    let mut req = request();
    req.home = Some("/a:/b:/c".to_string());
    let err = ConfigBuilder::from_request(ExecutionMode::Setuid, &probe, &host, &req).unwrap_err();
    assert!(matches!(err, Error::InvalidFlag { ref flag, .. } if flag == "--home"));
}

#[test]
fn test_security_requires_root() {
    let (probe, host) = (user_probe(), host());
    let mut req = request();
    req.security = vec!["uid:1001".to_string()];
    let err = ConfigBuilder::from_request(ExecutionMode::Setuid, &probe, &host, &req).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PolicyViolation);
}

#[test]
fn test_invalid_instance_name_rejected() {
    let (probe, host) = (user_probe(), host());
    let mut b = ConfigBuilder::new(ExecutionMode::Setuid, &probe, &host, "/img");
    assert!(matches!(
        b.set_instance("../escape"),
        Err(Error::InvalidInstanceName { .. })
    ));
}

// =============================================================================
// Flag Parsing
// =============================================================================

#[test]
fn test_bind_specs() {
    let binds = parse_bind_specs("/data, /scratch:/mnt/scratch:ro,/opt:/opt:rw").unwrap();
    assert_eq!(binds.len(), 3);
    assert_eq!(binds[0].source, PathBuf::from("/data"));
    assert_eq!(binds[0].dest, PathBuf::from("/data"));
    assert!(binds[1].read_only);
    assert_eq!(binds[1].dest, PathBuf::from("/mnt/scratch"));
    assert!(!binds[2].read_only);
}

#[test]
fn test_bind_spec_errors() {
    assert!(parse_bind_specs("relative/path").is_err());
    assert!(parse_bind_specs("/a:/b:noexec").is_err());
    assert!(parse_bind_specs("/a:/b:ro:extra").is_err());
}

#[test]
fn test_capabilities_normalized() {
    let caps = parse_capabilities("--add-caps", "net_raw, CAP_CHOWN,sys_ptrace").unwrap();
    assert_eq!(caps, vec!["CAP_NET_RAW", "CAP_CHOWN", "CAP_SYS_PTRACE"]);
    assert_eq!(parse_capabilities("--drop-caps", "all").unwrap(), vec!["ALL"]);
    assert!(parse_capabilities("--add-caps", "cap_fly").is_err());
}

#[test]
fn test_home_spec() {
    let home = parse_home("/scratch/me:/home/me").unwrap();
    assert_eq!(home.source, PathBuf::from("/scratch/me"));
    assert_eq!(home.dest, PathBuf::from("/home/me"));
    assert!(parse_home("/a:relative").is_err());
}

#[test]
fn test_subid_lookup() {
    let content = "# subordinate ids\nalice:100000:65536\n1000:200000:65536\nbob:300000:0\n";
    assert_eq!(parse_subid(content, Some("alice"), 1234), Some((100000, 65536)));
    assert_eq!(parse_subid(content, Some("carol"), 1000), Some((200000, 65536)));
    assert_eq!(parse_subid(content, Some("bob"), 4242), None);
}

// =============================================================================
// Sealing
// =============================================================================

#[test]
fn test_env_explicit_wins_over_forwarded() {
    let (probe, host) = (user_probe(), host());
    let mut req = request();
    req.host_env = vec![
        ("SIFRUN_ENV_FOO".to_string(), "host".to_string()),
        ("SIFRUN_ENV_BAR".to_string(), "bar".to_string()),
        ("UNRELATED".to_string(), "x".to_string()),
    ];
    req.env = vec!["FOO=flag".to_string()];
    let cfg = ConfigBuilder::from_request(ExecutionMode::Setuid, &probe, &host, &req)
        .unwrap()
        .seal()
        .unwrap();
    assert_eq!(cfg.env().get("FOO").map(String::as_str), Some("flag"));
    assert_eq!(cfg.env().get("BAR").map(String::as_str), Some("bar"));
    assert!(!cfg.env().contains_key("UNRELATED"));
}

#[test]
fn test_containall_implies_pid_ipc_clean_env() {
    let (probe, host) = (user_probe(), host());
    let mut req = request();
    req.containall = true;
    let cfg = ConfigBuilder::from_request(ExecutionMode::Setuid, &probe, &host, &req)
        .unwrap()
        .seal()
        .unwrap();
    assert!(cfg.contain());
    assert!(cfg.clean_env());
    assert!(cfg.namespaces().pid);
    assert!(cfg.namespaces().ipc);
    assert!(!cfg.namespaces().user);
    assert!(cfg.home().is_none());
}

#[test]
fn test_userns_identity_map() {
    let (probe, host) = (user_probe(), host());
    let cfg = ConfigBuilder::new(ExecutionMode::UserNamespace, &probe, &host, "/img")
        .seal()
        .unwrap();
    assert!(cfg.namespaces().user);
    let identity = IdMapEntry {
        container_id: 1000,
        host_id: 1000,
        size: 1,
    };
    assert_eq!(cfg.uid_map(), &[identity]);
    assert_eq!(cfg.gid_map(), &[identity]);
}

#[test]
fn test_setuid_has_no_id_maps() {
    let (probe, host) = (user_probe(), host());
    let cfg = ConfigBuilder::new(ExecutionMode::Setuid, &probe, &host, "/img")
        .seal()
        .unwrap();
    assert!(cfg.uid_map().is_empty());
    assert!(!cfg.namespaces().user);
}

#[test]
fn test_fakeroot_extended_map() {
    let tmp = TempDir::new().unwrap();
    let subuid = write_file(&tmp.path().join("subuid"), b"1000:100000:65536\n");
    let subgid = write_file(&tmp.path().join("subgid"), b"1000:200000:65536\n");
    let (probe, host) = (user_probe(), host());
    let mode = ExecutionMode::Fakeroot {
        setuid_assisted: false,
    };
    let cfg = ConfigBuilder::new(mode, &probe, &host, "/img")
        .with_subid_files(subuid, subgid)
        .seal()
        .unwrap();

    assert_eq!(
        cfg.uid_map(),
        &[
            IdMapEntry {
                container_id: 0,
                host_id: 1000,
                size: 1
            },
            IdMapEntry {
                container_id: 1,
                host_id: 100000,
                size: 65536
            },
        ]
    );
    assert_eq!(cfg.gid_map()[1].host_id, 200000);
}

#[test]
fn test_fakeroot_without_subids_maps_root_only() {
    let tmp = TempDir::new().unwrap();
    let (probe, host) = (user_probe(), host());
    let mode = ExecutionMode::Fakeroot {
        setuid_assisted: false,
    };
    let cfg = ConfigBuilder::new(mode, &probe, &host, "/img")
        .with_subid_files(tmp.path().join("none"), tmp.path().join("none"))
        .seal()
        .unwrap();
    assert_eq!(cfg.uid_map().len(), 1);
    assert_eq!(cfg.uid_map()[0].container_id, 0);
}

#[test]
fn test_system_target_uid_disables_home() {
    let probe = root_probe();
    let host = HostConfig::default();
    let mut req = request();
    req.security = vec!["uid:2,gid:2:3".to_string()];
    let cfg = ConfigBuilder::from_request(ExecutionMode::Setuid, &probe, &host, &req)
        .unwrap()
        .seal()
        .unwrap();
    assert_eq!(cfg.target_uid(), Some(2));
    assert_eq!(cfg.target_gids(), &[2, 3]);
    assert!(cfg.home().is_none());
}

#[test]
fn test_custom_home_kept() {
    let (probe, host) = (user_probe(), host());
    let mut b = ConfigBuilder::new(ExecutionMode::Setuid, &probe, &host, "/img");
    b.set_home("/scratch/u1000").unwrap();
    let cfg = b.seal().unwrap();
    let home = cfg.home().unwrap();
    assert_eq!(home.source, Path::new("/scratch/u1000"));
    assert_eq!(home.dest, Path::new("/scratch/u1000"));
}

#[test]
fn test_umask_captured_unless_disabled() {
    let (probe, host) = (user_probe(), host());
    let mut req = request();
    let cfg = ConfigBuilder::from_request(ExecutionMode::Setuid, &probe, &host, &req)
        .unwrap()
        .seal()
        .unwrap();
    assert!(cfg.umask().is_some());

    req.no_umask = true;
    let cfg = ConfigBuilder::from_request(ExecutionMode::Setuid, &probe, &host, &req)
        .unwrap()
        .seal()
        .unwrap();
    assert!(cfg.umask().is_none());
}

#[test]
fn test_rocm_without_allow_list_is_empty() {
    let tmp = TempDir::new().unwrap();
    let probe = user_probe();
    let host = HostConfig {
        config_dir: tmp.path().to_path_buf(),
        mount_home: false,
        ..HostConfig::default()
    };
    let mut b = ConfigBuilder::new(ExecutionMode::Setuid, &probe, &host, "/img");
    b.set_gpu(false, false, true);
    let cfg = b.seal().unwrap();
    assert_eq!(cfg.gpu().mode, GpuMode::Rocm);
    assert!(cfg.gpu().libraries.is_empty());
}

#[test]
fn test_sealed_config_serializes() {
    let (probe, host) = (user_probe(), host());
    let mut b = ConfigBuilder::new(ExecutionMode::UserNamespace, &probe, &host, "/img");
    b.add_binds("/data:/data:ro").unwrap();
    let cfg = b.seal().unwrap();
    let json = serde_json::to_string(&cfg).unwrap();
    let back: sifrun::EngineConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back, cfg);
}
