//! Finds the program interpreter (`PT_INTERP`) of an ELF binary.
//!
//! Parsing is done by `goblin`, which handles 32 and 64 bit objects of
//! either byte order.

use std::fs;
use std::path::{Path, PathBuf};

use goblin::elf::Elf;

use crate::error::{Error, Result};

/// Returns the dynamic loader requested by the ELF binary at `path`, or
/// `None` for a statically linked binary.
pub fn interpreter(path: &Path) -> Result<Option<PathBuf>> {
    let err = |reason: String| Error::ElfParse {
        path: path.to_path_buf(),
        reason,
    };

    let bytes = fs::read(path).map_err(|e| err(e.to_string()))?;
    let elf = Elf::parse(&bytes).map_err(|e| err(e.to_string()))?;

    match elf.interpreter {
        None => Ok(None),
        Some(interp) if interp.starts_with('/') => Ok(Some(PathBuf::from(interp))),
        Some(interp) => Err(err(format!("relative interpreter path {}", interp))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const PT_LOAD: u32 = 1;
    const PT_INTERP: u32 = 3;

    /// Builds a little-endian ELF64 image with a single program header.
    fn elf64_with_header(p_type: u32, interp: &str) -> Vec<u8> {
        let mut img = vec![0u8; 64 + 56];
        img[..4].copy_from_slice(b"\x7fELF");
        img[4] = 2; // ELFCLASS64
        img[5] = 1; // ELFDATA2LSB
        img[6] = 1; // EV_CURRENT
        img[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        img[18..20].copy_from_slice(&62u16.to_le_bytes()); // EM_X86_64
        img[20..24].copy_from_slice(&1u32.to_le_bytes());
        img[32..40].copy_from_slice(&64u64.to_le_bytes());
        img[52..54].copy_from_slice(&64u16.to_le_bytes());
        img[54..56].copy_from_slice(&56u16.to_le_bytes());
        img[56..58].copy_from_slice(&1u16.to_le_bytes());

        let data_off = img.len() as u64;
        let len = interp.len() as u64 + 1;
        let ph = &mut img[64..120];
        ph[0..4].copy_from_slice(&p_type.to_le_bytes());
        ph[8..16].copy_from_slice(&data_off.to_le_bytes());
        ph[32..40].copy_from_slice(&len.to_le_bytes());
        ph[40..48].copy_from_slice(&len.to_le_bytes());

        img.extend_from_slice(interp.as_bytes());
        img.push(0);
        img
    }

    fn write_temp(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        f
    }

    #[test]
    fn test_reads_synthetic_interp() {
        let f = write_temp(&elf64_with_header(PT_INTERP, "/lib64/ld-linux-x86-64.so.2"));
        assert_eq!(
            interpreter(f.path()).unwrap(),
            Some(PathBuf::from("/lib64/ld-linux-x86-64.so.2"))
        );
    }

    #[test]
    fn test_static_binary_has_no_interp() {
        let f = write_temp(&elf64_with_header(PT_LOAD, "/x"));
        assert_eq!(interpreter(f.path()).unwrap(), None);
    }

    #[test]
    fn test_relative_interp_rejected() {
        let f = write_temp(&elf64_with_header(PT_INTERP, "ld.so"));
        let err = interpreter(f.path()).unwrap_err();
        assert!(err.to_string().contains("relative interpreter"));
    }

    #[test]
    fn test_rejects_non_elf() {
        let f = write_temp(b"#!/bin/sh\necho not elf, just long enough to read the header\n");
        assert!(matches!(interpreter(f.path()), Err(Error::ElfParse { .. })));
    }

    #[test]
    fn test_reads_host_shell() {
        let sh = std::fs::canonicalize("/bin/sh").unwrap();
        // dynamically linked on every supported distro; static shells just skip
        if let Some(interp) = interpreter(&sh).unwrap() {
            assert!(interp.is_absolute());
        }
    }
}
