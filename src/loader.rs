//! Guest image loading.
//!
//! Two formats are supported: ELF executables, whose loadable segments are
//! mapped at their requested addresses with their segment permissions, and
//! flat binaries, which map read-execute at [`FLAT_IMAGE_BASE`] with the
//! entry point at the image start.

use std::path::Path;

use goblin::elf::{Elf, program_header};

use crate::error::{EmuError, EmuResult};
use crate::vm::{AddressSpace, Perms};

/// Load address (and entry point) for flat binary images.
pub const FLAT_IMAGE_BASE: u64 = 0x40_0000;

/// Result of mapping a guest image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedImage {
    /// Guest address execution starts at.
    pub entry: u64,
}

/// Load an image file, detecting ELF by magic and treating everything
/// else as a flat binary.
///
/// # Errors
///
/// Returns [`EmuError::BadImage`] for unreadable files and malformed ELF
/// content, and propagates mapping failures.
pub fn load_file(path: &Path, space: &mut AddressSpace) -> EmuResult<LoadedImage> {
    let bytes = std::fs::read(path)
        .map_err(|e| EmuError::BadImage(format!("cannot read {}: {e}", path.display())))?;
    if bytes.starts_with(b"\x7fELF") {
        load_elf(&bytes, space)
    } else {
        load_flat(&bytes, space)
    }
}

/// Map a flat binary at [`FLAT_IMAGE_BASE`] as read-execute.
///
/// # Errors
///
/// Returns [`EmuError::BadImage`] for an empty image and propagates
/// mapping failures.
pub fn load_flat(image: &[u8], space: &mut AddressSpace) -> EmuResult<LoadedImage> {
    if image.is_empty() {
        return Err(EmuError::BadImage("empty flat image".into()));
    }
    space.map(FLAT_IMAGE_BASE, image.len(), Perms::READ | Perms::WRITE)?;
    space.copy_to(FLAT_IMAGE_BASE, image)?;
    space.protect(FLAT_IMAGE_BASE, Perms::READ | Perms::EXEC)?;
    Ok(LoadedImage {
        entry: FLAT_IMAGE_BASE,
    })
}

/// Map the loadable segments of an ELF executable.
///
/// # Errors
///
/// Returns [`EmuError::BadImage`] for parse failures, a non-`AArch64`
/// machine, or segment data outside the file, and propagates mapping
/// failures (overlapping segments included).
pub fn load_elf(bytes: &[u8], space: &mut AddressSpace) -> EmuResult<LoadedImage> {
    let elf = Elf::parse(bytes).map_err(|e| EmuError::BadImage(format!("bad ELF: {e}")))?;

    if elf.header.e_machine != goblin::elf::header::EM_AARCH64 {
        return Err(EmuError::BadImage(format!(
            "unsupported machine type {:#x}",
            elf.header.e_machine
        )));
    }

    let mut mapped = 0usize;
    for ph in &elf.program_headers {
        if ph.p_type != program_header::PT_LOAD || ph.p_memsz == 0 {
            continue;
        }

        let file_range = ph.file_range();
        let data = bytes
            .get(file_range)
            .ok_or_else(|| EmuError::BadImage("segment data outside file".into()))?;

        #[allow(clippy::cast_possible_truncation)]
        let mem_size = ph.p_memsz as usize;
        if data.len() > mem_size {
            return Err(EmuError::BadImage("segment file size exceeds memory size".into()));
        }

        // Map writable for the copy, then drop to the segment permissions.
        space.map(ph.p_vaddr, mem_size, Perms::READ | Perms::WRITE)?;
        space.copy_to(ph.p_vaddr, data)?;
        space.protect(ph.p_vaddr, segment_perms(ph.p_flags))?;
        mapped += 1;
    }

    if mapped == 0 {
        return Err(EmuError::BadImage("no loadable segments".into()));
    }
    Ok(LoadedImage {
        entry: elf.header.e_entry,
    })
}

fn segment_perms(p_flags: u32) -> Perms {
    let mut perms = Perms::NONE;
    if p_flags & program_header::PF_R != 0 {
        perms |= Perms::READ;
    }
    if p_flags & program_header::PF_W != 0 {
        perms |= Perms::WRITE;
    }
    if p_flags & program_header::PF_X != 0 {
        perms |= Perms::EXEC;
    }
    perms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_image_maps_read_execute_at_base() {
        let mut space = AddressSpace::new();
        let image = [0x20, 0x00, 0x80, 0xD2, 0x00, 0x00, 0x00, 0x14];
        let loaded = load_flat(&image, &mut space).unwrap();

        assert_eq!(loaded.entry, FLAT_IMAGE_BASE);
        assert!(space.fetch_u32(FLAT_IMAGE_BASE).is_ok());
        assert_eq!(space.read_u8(FLAT_IMAGE_BASE).unwrap(), 0x20);
        assert!(space.write_u8(FLAT_IMAGE_BASE, 0).is_err());

        let info = space.regions().next().unwrap();
        assert_eq!(info.start, FLAT_IMAGE_BASE);
        assert_eq!(info.len, image.len());
        assert_eq!(info.perms, Perms::READ | Perms::EXEC);
    }

    #[test]
    fn test_empty_flat_image_rejected() {
        let mut space = AddressSpace::new();
        assert!(load_flat(&[], &mut space).is_err());
    }

    #[test]
    fn test_load_file_sniffs_format() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0x1F, 0x20, 0x03, 0xD5]).unwrap();

        let mut space = AddressSpace::new();
        let loaded = load_file(file.path(), &mut space).unwrap();
        assert_eq!(loaded.entry, FLAT_IMAGE_BASE);
    }

    #[test]
    fn test_truncated_elf_rejected() {
        let mut space = AddressSpace::new();
        let err = load_elf(b"\x7fELF\x02\x01\x01\x00", &mut space);
        assert!(matches!(err, Err(EmuError::BadImage(_))));
    }

    #[test]
    fn test_missing_file_rejected() {
        let mut space = AddressSpace::new();
        assert!(load_file(Path::new("/nonexistent/guest.bin"), &mut space).is_err());
    }
}
