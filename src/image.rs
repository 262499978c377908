//! Image format detection.
//!
//! Identifies what kind of image a path points at, and for SIF containers
//! locates the primary root filesystem partition and its filesystem type.
//!
//! ## SIF Layout
//!
//! ```text
//! ┌──────────────────────────────┐ 0
//! │ global header (128 bytes)    │ launch script, "SIF_MAGIC", offsets
//! ├──────────────────────────────┤ descriptors_offset
//! │ descriptor[0] (585 bytes)    │ type, offset, size, extra
//! │ descriptor[1] ...            │
//! ├──────────────────────────────┤ data_offset
//! │ partition data ...           │
//! └──────────────────────────────┘
//! ```
//!
//! All integers are little-endian and the structures are packed.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const SIF_MAGIC: &[u8; 9] = b"SIF_MAGIC";
const SIF_MAGIC_OFFSET: usize = 32;
const SIF_HEADER_LEN: usize = 128;
const SIF_DESCRIPTOR_LEN: usize = 585;
const SIF_MAX_DESCRIPTORS: u64 = 4096;

const SIF_DATA_PARTITION: i32 = 0x4004;
const SIF_PART_PRIMSYS: i32 = 2;

const SQUASHFS_MAGIC: &[u8; 4] = b"hsqs";
const EXT_MAGIC_OFFSET: u64 = 1080;
const EXT_MAGIC: [u8; 2] = [0x53, 0xef];

/// Filesystem carried by a SIF partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionFs {
    Squashfs,
    Ext3,
    ImmutableObject,
    Raw,
    EncryptedSquashfs,
    Unknown(i32),
}

impl PartitionFs {
    fn from_raw(v: i32) -> Self {
        match v {
            1 => Self::Squashfs,
            2 => Self::Ext3,
            3 => Self::ImmutableObject,
            4 => Self::Raw,
            5 => Self::EncryptedSquashfs,
            other => Self::Unknown(other),
        }
    }
}

/// Root filesystem partition inside a SIF file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// Filesystem type.
    pub fs: PartitionFs,
    /// Absolute byte offset in the SIF file.
    pub offset: u64,
    /// Size in bytes.
    pub size: u64,
}

/// What an image path contains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageFormat {
    /// Single-file SIF container with its primary partition.
    Sif(Partition),
    /// Bare squashfs image.
    Squashfs { size: u64 },
    /// Bare ext3 image.
    Ext3,
    /// Sandbox directory.
    Sandbox,
}

impl ImageFormat {
    /// Returns true if the image is a single file rather than a directory.
    pub fn is_single_file(&self) -> bool {
        !matches!(self, Self::Sandbox)
    }

    /// Returns true if the root filesystem is encrypted.
    pub fn is_encrypted(&self) -> bool {
        matches!(
            self,
            Self::Sif(Partition {
                fs: PartitionFs::EncryptedSquashfs,
                ..
            })
        )
    }

    /// Returns true if the root filesystem can be extracted with a squashfs
    /// extractor.
    pub fn is_squashfs(&self) -> bool {
        matches!(
            self,
            Self::Squashfs { .. }
                | Self::Sif(Partition {
                    fs: PartitionFs::Squashfs,
                    ..
                })
        )
    }

    /// Short lowercase name for logs and driver matching.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sif(_) => "sif",
            Self::Squashfs { .. } => "squashfs",
            Self::Ext3 => "ext3",
            Self::Sandbox => "sandbox",
        }
    }
}

/// An image opened for inspection.
#[derive(Debug, Clone)]
pub struct Image {
    /// Canonical path of the image.
    pub path: PathBuf,
    /// Detected format.
    pub format: ImageFormat,
}

impl Image {
    /// Opens and identifies `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let path = path.canonicalize().map_err(|e| Error::ImageNotFound {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        if path.is_dir() {
            return Ok(Self {
                path,
                format: ImageFormat::Sandbox,
            });
        }

        let mut file = File::open(&path).map_err(|e| Error::ImageNotFound {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let format = detect_format(&path, &mut file)?;
        Ok(Self { path, format })
    }
}

fn detect_format(path: &Path, file: &mut File) -> Result<ImageFormat> {
    let len = file.metadata()?.len();

    let mut head = [0u8; SIF_HEADER_LEN];
    let n = read_at_most(file, &mut head)?;
    let head = &head[..n];

    if head.len() >= SIF_MAGIC_OFFSET + SIF_MAGIC.len()
        && &head[SIF_MAGIC_OFFSET..SIF_MAGIC_OFFSET + SIF_MAGIC.len()] == SIF_MAGIC
    {
        return read_sif_partition(path, file, head).map(ImageFormat::Sif);
    }

    if head.starts_with(SQUASHFS_MAGIC) {
        return Ok(ImageFormat::Squashfs { size: len });
    }

    if len >= EXT_MAGIC_OFFSET + 2 {
        let mut magic = [0u8; 2];
        file.seek(SeekFrom::Start(EXT_MAGIC_OFFSET))?;
        file.read_exact(&mut magic)?;
        if magic == EXT_MAGIC {
            return Ok(ImageFormat::Ext3);
        }
    }

    Err(Error::UnsupportedImageFormat {
        path: path.to_path_buf(),
        reason: "unknown image format".to_string(),
    })
}

fn read_sif_partition(path: &Path, file: &mut File, head: &[u8]) -> Result<Partition> {
    let invalid = |reason: &str| Error::InvalidSif {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    if head.len() < SIF_HEADER_LEN {
        return Err(invalid("truncated global header"));
    }

    // launch[32] magic[10] version[3] arch[3] uuid[16] ctime mtime dfree dtotal descoff ...
    let dtotal = le_i64(head, 88);
    let descoff = le_i64(head, 96);
    if dtotal <= 0 || descoff < 0 || dtotal as u64 > SIF_MAX_DESCRIPTORS {
        return Err(invalid("bad descriptor table"));
    }

    file.seek(SeekFrom::Start(descoff as u64))?;
    let mut table = vec![0u8; dtotal as usize * SIF_DESCRIPTOR_LEN];
    file.read_exact(&mut table)
        .map_err(|_| invalid("truncated descriptor table"))?;

    for desc in table.chunks_exact(SIF_DESCRIPTOR_LEN) {
        // datatype i32, used u8, id u32, groupid u32, link u32, offset i64, size i64, ...
        let datatype = le_i32(desc, 0);
        let used = desc[4] != 0;
        if !used || datatype != SIF_DATA_PARTITION {
            continue;
        }
        let offset = le_i64(desc, 17);
        let size = le_i64(desc, 25);
        // extra[384] starts after name[128]: fstype i32, parttype i32, arch[3]
        let extra = 4 + 1 + 4 * 3 + 8 * 7 + 128;
        let fstype = le_i32(desc, extra);
        let parttype = le_i32(desc, extra + 4);
        if parttype != SIF_PART_PRIMSYS {
            continue;
        }
        if offset < 0 || size < 0 {
            return Err(invalid("negative partition bounds"));
        }
        return Ok(Partition {
            fs: PartitionFs::from_raw(fstype),
            offset: offset as u64,
            size: size as u64,
        });
    }

    Err(invalid("no primary system partition"))
}

fn read_at_most(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

fn le_i32(buf: &[u8], at: usize) -> i32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    i32::from_le_bytes(b)
}

fn le_i64(buf: &[u8], at: usize) -> i64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    i64::from_le_bytes(b)
}
