//! Boot image loading for the system-mode `mips-run` binary.
//!
//! Unlike `loader.rs` (a Linux user-mode ELF loader that mmaps PT_LOAD
//! segments into a process-wide flat guest address space and builds an
//! argv/envp/auxv stack per the Linux ABI), a bare-metal MIPS64 boot
//! has no process, no argv, and no stack convention to honor: the ROM
//! or ELF image is copied into the CPU's own physical RAM buffer and
//! the reset vector takes it from there. `Elf64Ehdr` in `elf.rs` also
//! assumes a little-endian host reading a little-endian (RISC-V) file;
//! Cisco-class MIPS64 images are big-endian, so this module parses ELF
//! headers by hand instead of reusing that struct.

use std::fmt;
use std::fs;
use std::path::Path;

use tcg_core::mips_cpu::MipsCpu;
use tcg_core::mts::MtsBacking;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ELFDATA2MSB: u8 = 2;
const PT_LOAD: u32 = 1;

/// Sign-extended MIPS64 kseg0/kseg1 windows (direct-mapped, no TLB
/// lookup on real hardware). `Cp0::translate` only models the TLB
/// (see DESIGN.md), so this loader wires both windows straight into
/// the MTS at load time — otherwise nothing would be reachable before
/// the guest sets up its own page tables.
const KSEG0_BASE: u64 = 0xFFFF_FFFF_8000_0000;
const KSEG1_BASE: u64 = 0xFFFF_FFFF_A000_0000;
const KSEG_WINDOW_SIZE: u64 = 0x2000_0000;

#[derive(Debug)]
pub enum MipsLoadError {
    Io(std::io::Error),
    TooSmall,
    InvalidMagic,
    UnsupportedClass,
    NoLoadSegment,
    SegmentOutOfRange,
    ImageTooLarge,
}

impl fmt::Display for MipsLoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O: {e}"),
            Self::TooSmall => write!(f, "image too small to be an ELF file"),
            Self::InvalidMagic => write!(f, "invalid ELF magic"),
            Self::UnsupportedClass => write!(f, "not ELF64"),
            Self::NoLoadSegment => write!(f, "ELF has no PT_LOAD segment"),
            Self::SegmentOutOfRange => write!(f, "segment falls outside guest RAM"),
            Self::ImageTooLarge => write!(f, "image larger than configured ram_size"),
        }
    }
}

impl std::error::Error for MipsLoadError {}

impl From<std::io::Error> for MipsLoadError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Result of loading a boot image: the PC execution should start at.
/// For a raw ROM image this is always the caller-supplied `entry_pc`;
/// for an ELF image it's the file's own entry point.
pub struct BootImage {
    pub entry_pc: u64,
}

/// Loads `path` into `ram` (resized to `ram_size` bytes and zero-filled
/// first) and wires `cpu`'s MTS so kseg0/kseg1 addresses over that RAM
/// resolve without touching the TLB. ELF64 images are detected by magic
/// and their PT_LOAD segments copied to `p_paddr`; anything else is
/// treated as a raw image and copied starting at physical offset 0.
pub fn load_boot_image(
    path: &Path,
    ram_size: u64,
    configured_entry_pc: u64,
    cpu: &mut MipsCpu,
    ram: &mut Vec<u8>,
) -> Result<BootImage, MipsLoadError> {
    ram.clear();
    ram.resize(ram_size as usize, 0);

    let data = fs::read(path)?;
    let entry_pc = if is_elf(&data) {
        load_elf_segments(&data, ram)?
    } else {
        if data.len() as u64 > ram_size {
            return Err(MipsLoadError::ImageTooLarge);
        }
        ram[..data.len()].copy_from_slice(&data);
        configured_entry_pc
    };

    cpu.bind_ram(ram.as_mut_ptr(), ram.len() as u64);
    wire_kseg_windows(cpu, ram.as_mut_ptr(), ram.len() as u64);

    Ok(BootImage { entry_pc })
}

fn is_elf(data: &[u8]) -> bool {
    data.len() >= 4 && data[0..4] == ELF_MAGIC
}

/// Copies every PT_LOAD segment's file contents to its `p_paddr` within
/// `ram`. Returns the file's `e_entry`.
fn load_elf_segments(data: &[u8], ram: &mut [u8]) -> Result<u64, MipsLoadError> {
    if data.len() < 64 {
        return Err(MipsLoadError::TooSmall);
    }
    if data[0..4] != ELF_MAGIC {
        return Err(MipsLoadError::InvalidMagic);
    }
    if data[4] != ELFCLASS64 {
        return Err(MipsLoadError::UnsupportedClass);
    }
    let big_endian = match data[5] {
        ELFDATA2MSB => true,
        ELFDATA2LSB => false,
        _ => return Err(MipsLoadError::UnsupportedClass),
    };

    let u16_at = |off: usize| -> u16 {
        let b = &data[off..off + 2];
        if big_endian { u16::from_be_bytes([b[0], b[1]]) } else { u16::from_le_bytes([b[0], b[1]]) }
    };
    let u32_at = |off: usize| -> u32 {
        let b = &data[off..off + 4];
        if big_endian {
            u32::from_be_bytes([b[0], b[1], b[2], b[3]])
        } else {
            u32::from_le_bytes([b[0], b[1], b[2], b[3]])
        }
    };
    let u64_at = |off: usize| -> u64 {
        let b = &data[off..off + 8];
        if big_endian {
            u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
        } else {
            u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
        }
    };

    let e_entry = u64_at(24);
    let e_phoff = u64_at(32) as usize;
    let e_phentsize = u16_at(54) as usize;
    let e_phnum = u16_at(56) as usize;

    if e_phentsize < 56 {
        return Err(MipsLoadError::TooSmall);
    }

    let mut has_load = false;
    for i in 0..e_phnum {
        let ph = e_phoff + i * e_phentsize;
        if ph + 56 > data.len() {
            return Err(MipsLoadError::TooSmall);
        }
        let p_type = u32_at(ph);
        if p_type != PT_LOAD {
            continue;
        }
        has_load = true;
        let p_offset = u64_at(ph + 8) as usize;
        let p_paddr = u64_at(ph + 16);
        let p_filesz = u64_at(ph + 32) as usize;
        let p_memsz = u64_at(ph + 40) as usize;

        let src_end = p_offset.checked_add(p_filesz).ok_or(MipsLoadError::SegmentOutOfRange)?;
        if src_end > data.len() {
            return Err(MipsLoadError::SegmentOutOfRange);
        }
        let dst_end = (p_paddr as usize).checked_add(p_memsz).ok_or(MipsLoadError::SegmentOutOfRange)?;
        if dst_end > ram.len() {
            return Err(MipsLoadError::SegmentOutOfRange);
        }

        let dst = p_paddr as usize;
        ram[dst..dst + p_filesz].copy_from_slice(&data[p_offset..src_end]);
        // BSS tail (memsz > filesz) is already zero from the earlier resize.
    }

    if !has_load {
        return Err(MipsLoadError::NoLoadSegment);
    }

    Ok(e_entry)
}

/// Installs identity mappings for `ram` into both the kseg0 and kseg1
/// windows, page by page.
fn wire_kseg_windows(cpu: &mut MipsCpu, ram_base: *mut u8, ram_size: u64) {
    let page_size = tcg_core::mts::MTS_PAGE_SIZE;
    let mapped = ram_size.min(KSEG_WINDOW_SIZE);
    let mut off = 0u64;
    while off < mapped {
        let host_base = unsafe { ram_base.add(off as usize) };
        cpu.mts.insert(KSEG0_BASE + off, MtsBacking::Ram { host_base, writable: true });
        cpu.mts.insert(KSEG1_BASE + off, MtsBacking::Ram { host_base, writable: true });
        off += page_size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_image_loads_at_physical_zero_and_wires_kseg1() {
        let dir = std::env::temp_dir();
        let path = dir.join("mips_loader_test_raw.bin");
        std::fs::write(&path, [0xAA_u8; 16]).unwrap();

        let mut cpu = MipsCpu::new(0, 0, 0);
        let mut ram = Vec::new();
        let img = load_boot_image(&path, 0x1000, 0xFFFF_FFFF_BFC0_0000, &mut cpu, &mut ram).unwrap();
        assert_eq!(img.entry_pc, 0xFFFF_FFFF_BFC0_0000);
        assert_eq!(&ram[0..16], &[0xAA_u8; 16]);

        let entry = cpu.mts.lookup(KSEG1_BASE).unwrap();
        match entry.backing {
            MtsBacking::Ram { host_base, writable } => {
                assert!(writable);
                assert_eq!(unsafe { *host_base }, 0xAA);
            }
            _ => panic!("expected RAM backing"),
        }

        std::fs::remove_file(&path).ok();
    }
}
