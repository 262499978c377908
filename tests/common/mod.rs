//! Shared fixtures for integration tests: synthetic images and stub
//! executables standing in for the extractor and the starter.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use sifrun::{CapabilityProbe, CapabilitySet, HostConfig};

pub const FS_SQUASHFS: i32 = 1;
pub const FS_EXT3: i32 = 2;
pub const FS_ENCRYPTED_SQUASHFS: i32 = 5;

const SIF_HEADER_LEN: usize = 128;
const SIF_DESCRIPTOR_LEN: usize = 585;

/// Bytes of a bare squashfs image: magic followed by filler.
pub fn squashfs_bytes() -> Vec<u8> {
    let mut img = b"hsqs".to_vec();
    img.extend(std::iter::repeat_n(0xAB, 252));
    img
}

/// Bytes of a single-partition SIF whose primary system partition has
/// filesystem type `fstype` and contents `payload`.
pub fn sif_bytes(fstype: i32, payload: &[u8]) -> Vec<u8> {
    let data_off = (SIF_HEADER_LEN + SIF_DESCRIPTOR_LEN) as i64;
    let mut img = vec![0u8; SIF_HEADER_LEN + SIF_DESCRIPTOR_LEN];

    img[..32].copy_from_slice(&[b'#'; 32]);
    img[32..41].copy_from_slice(b"SIF_MAGIC");
    img[88..96].copy_from_slice(&1i64.to_le_bytes());
    img[96..104].copy_from_slice(&(SIF_HEADER_LEN as i64).to_le_bytes());

    let d = &mut img[SIF_HEADER_LEN..];
    d[0..4].copy_from_slice(&0x4004i32.to_le_bytes());
    d[4] = 1;
    d[17..25].copy_from_slice(&data_off.to_le_bytes());
    d[25..33].copy_from_slice(&(payload.len() as i64).to_le_bytes());
    d[201..205].copy_from_slice(&fstype.to_le_bytes());
    d[205..209].copy_from_slice(&2i32.to_le_bytes());

    img.extend_from_slice(payload);
    img
}

/// Bytes of a bare ext3 image (superblock magic only).
pub fn ext3_bytes() -> Vec<u8> {
    let mut img = vec![0u8; 2048];
    img[1080] = 0x53;
    img[1081] = 0xEF;
    img
}

/// Bytes of a little-endian ELF64 executable whose only program header
/// is a `PT_INTERP` naming `interp`.
pub fn elf_bytes_with_interp(interp: &str) -> Vec<u8> {
    let mut img = vec![0u8; 64 + 56];
    img[..4].copy_from_slice(b"\x7fELF");
    img[4] = 2;
    img[5] = 1;
    img[6] = 1;
    img[16..18].copy_from_slice(&2u16.to_le_bytes());
    img[18..20].copy_from_slice(&62u16.to_le_bytes());
    img[20..24].copy_from_slice(&1u32.to_le_bytes());
    img[32..40].copy_from_slice(&64u64.to_le_bytes());
    img[52..54].copy_from_slice(&64u16.to_le_bytes());
    img[54..56].copy_from_slice(&56u16.to_le_bytes());
    img[56..58].copy_from_slice(&1u16.to_le_bytes());

    let data_off = img.len() as u64;
    let len = interp.len() as u64 + 1;
    let ph = &mut img[64..120];
    ph[0..4].copy_from_slice(&3u32.to_le_bytes());
    ph[8..16].copy_from_slice(&data_off.to_le_bytes());
    ph[32..40].copy_from_slice(&len.to_le_bytes());
    ph[40..48].copy_from_slice(&len.to_le_bytes());

    img.extend_from_slice(interp.as_bytes());
    img.push(0);
    img
}

pub fn write_file(path: &Path, bytes: &[u8]) -> PathBuf {
    fs::write(path, bytes).unwrap();
    path.to_path_buf()
}

/// Writes an executable shell script.
pub fn write_script(path: &Path, body: &str) -> PathBuf {
    fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    path.to_path_buf()
}

/// Extractor stub: `-f -d DEST SOURCE` copies SOURCE to DEST/archive.
pub fn stub_extractor(dir: &Path) -> PathBuf {
    write_script(
        &dir.join("unsquashfs"),
        r#"[ "$1" = "-f" ] && [ "$2" = "-d" ] || exit 64
mkdir -p "$3" && cp "$4" "$3/archive""#,
    )
}

/// Extractor stub that always fails.
pub fn failing_extractor(dir: &Path) -> PathBuf {
    write_script(
        &dir.join("unsquashfs-broken"),
        r#"mkdir -p "$3/partial"
echo "FATAL ERROR: corrupt superblock" >&2
exit 1"#,
    )
}

/// Starter stub: copies its payload descriptor to stdout and reports the
/// message level on stderr.
pub fn stub_starter(dir: &Path) -> PathBuf {
    write_script(
        &dir.join("starter"),
        r#"cat <&3
echo "level=$SIFRUN_MESSAGELEVEL" >&2"#,
    )
}

pub fn user_probe() -> CapabilityProbe {
    CapabilityProbe::from_parts(1000, 1000, false, CapabilitySet::EMPTY)
}

pub fn root_probe() -> CapabilityProbe {
    CapabilityProbe::from_parts(0, 0, false, CapabilitySet::EMPTY.with(21))
}

/// Host configuration rooted in `dir` with direct extraction through
/// `extractor`.
pub fn host_config(dir: &Path, extractor: &Path) -> HostConfig {
    let temp = dir.join("tmp");
    fs::create_dir_all(&temp).unwrap();
    HostConfig {
        config_dir: dir.join("etc"),
        temp_dir: temp,
        instance_dir: Some(dir.join("instances")),
        unsquashfs: extractor.to_path_buf(),
        sandboxed_extraction: false,
        mount_home: false,
        ..HostConfig::default()
    }
}

/// Runtime stub for nested extraction: skips to the extractor arguments
/// and copies SOURCE to DEST/archive, like [`stub_extractor`].
pub fn stub_runtime(dir: &Path) -> PathBuf {
    write_script(
        &dir.join("sifrun-runtime"),
        r#"while [ $# -gt 0 ] && [ "$1" != "-f" ]; do shift; done
[ "$2" = "-d" ] || exit 64
mkdir -p "$3" && cp "$4" "$3/archive""#,
    )
}

/// Runtime stub that fails every nested extraction.
pub fn failing_runtime(dir: &Path) -> PathBuf {
    write_script(
        &dir.join("sifrun-runtime-broken"),
        r#"echo "FATAL: container creation failed" >&2
exit 255"#,
    )
}

/// Entries of `dir` whose names start with `prefix`.
pub fn entries_with_prefix(dir: &Path, prefix: &str) -> Vec<PathBuf> {
    match fs::read_dir(dir) {
        Ok(rd) => rd
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(prefix))
            .map(|e| e.path())
            .collect(),
        Err(_) => Vec::new(),
    }
}
