//! Linux x86 boot protocol loader.
//!
//! Parses a bzImage setup header, lays out the zero page / command line /
//! protected-mode payload / initrd, installs a minimal GDT, and programs
//! CPU entry state so the first fetched instruction is the kernel's
//! 32-bit entry point with ESI pointing at the zero page.
//!
//! Grounded on `hypervisor::linux_loader::{parse_bzimage, load_linux_kernel,
//! setup_boot_params, setup_e820_map, setup_guest_gdt}`, narrowed from that
//! module's 64-bit/paged boot path to the flat 32-bit protected-mode entry
//! this target's boot protocol actually requires.

use crate::cpu::segments::SegmentId;
use crate::cpu::sysregs::CR0_PE;
use crate::emulator::Emulator;
use crate::error::{EmuError, Result};

/// Where the zero page (boot_params, including the setup header at +0x1F1)
/// is placed in guest physical memory.
pub const BOOT_PARAMS_ADDR: u32 = 0x0001_0000;
/// Where the protected-mode kernel payload lands.
pub const PROTECTED_MODE_KERNEL_ADDR: u32 = 0x0010_0000;
/// Where the kernel command line is placed.
pub const CMDLINE_ADDR: u32 = 0x0002_0000;
/// Where an initrd, if present, is placed.
pub const INITRD_ADDR: u32 = 0x07F0_0000;
/// Real-mode fallback entry segment when the kernel is not LOADED_HIGH.
pub const REAL_MODE_ENTRY_SEGMENT: u16 = 0x9000;
/// Base address of the minimal GDT this loader installs.
pub const GDT_ADDR: u32 = 0x0001_F000;

const LOADED_HIGH: u8 = 0x01;
const CAN_USE_HEAP: u8 = 0x80;
const CMDLINE_MAX: usize = 255;

/// Fields the core consumes from the setup header at offset 0x1F1.
#[derive(Debug, Clone, Copy)]
pub struct SetupHeader {
    pub setup_sects: u8,
    pub syssize: u32,
    pub boot_flag: u16,
    pub header_magic: u32,
    pub version: u16,
    pub loadflags: u8,
    pub code32_start: u32,
    pub cmd_line_ptr: u32,
    pub ramdisk_image: u32,
    pub ramdisk_size: u32,
}

const BOOT_FLAG_MAGIC: u16 = 0xAA55;
const HDR_MAGIC: u32 = 0x5372_6448; // "HdrS"
const MIN_VERSION: u16 = 0x0200;

fn read_u16_at(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([data[off], data[off + 1]])
}

fn read_u32_at(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

impl SetupHeader {
    /// Parse and validate the setup header embedded in a bzImage buffer.
    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 0x400 {
            return Err(EmuError::InvalidKernel {
                reason: "kernel image shorter than the minimum boot sector",
            });
        }

        let boot_flag = read_u16_at(data, 0x1FE);
        if boot_flag != BOOT_FLAG_MAGIC {
            return Err(EmuError::InvalidBootSector);
        }

        let header_magic = read_u32_at(data, 0x202);
        if header_magic != HDR_MAGIC {
            return Err(EmuError::InvalidBootHeader {
                reason: "missing HdrS signature",
            });
        }

        let version = read_u16_at(data, 0x206);
        if version < MIN_VERSION {
            return Err(EmuError::UnsupportedBootProtocol { version });
        }

        let setup_sects = match data[0x1F1] {
            0 => 4,
            n => n,
        };
        let syssize = read_u32_at(data, 0x1F4);
        if syssize == 0 && data.len() > (setup_sects as usize + 1) * 512 + 0x1000 {
            return Err(EmuError::InvalidKernel {
                reason: "syssize is zero for a non-trivial image",
            });
        }

        let code32_start = match read_u32_at(data, 0x214) {
            0 => PROTECTED_MODE_KERNEL_ADDR,
            addr => addr,
        };

        Ok(SetupHeader {
            setup_sects,
            syssize,
            boot_flag,
            header_magic,
            version,
            loadflags: data[0x211],
            code32_start,
            cmd_line_ptr: read_u32_at(data, 0x228),
            ramdisk_image: read_u32_at(data, 0x218),
            ramdisk_size: read_u32_at(data, 0x21C),
        })
    }

    fn loaded_high(&self) -> bool {
        self.loadflags & LOADED_HIGH != 0
    }
}

/// Owns copies of the kernel image, command line, and optional initrd, and
/// knows how to lay them out into an `Emulator`'s memory and CPU state.
pub struct DirectBoot {
    kernel: Vec<u8>,
    cmdline: Vec<u8>,
    initrd: Option<Vec<u8>>,
    header: SetupHeader,
}

impl DirectBoot {
    /// Parse `kernel`'s setup header without mutating anything. `cmdline`
    /// is truncated to 255 bytes per the Linux boot protocol's cmd_line_ptr
    /// convention; it need not be nul-terminated by the caller.
    pub fn new(kernel: &[u8], cmdline: &str, initrd: Option<&[u8]>) -> Result<Self> {
        let header = SetupHeader::parse(kernel)?;
        log::debug!(
            "parsed bzImage: setup_sects={} version={:#06x} loadflags={:#04x} code32_start={:#x}",
            header.setup_sects,
            header.version,
            header.loadflags,
            header.code32_start,
        );
        Ok(DirectBoot {
            kernel: kernel.to_vec(),
            cmdline: cmdline.as_bytes().to_vec(),
            initrd: initrd.map(|b| b.to_vec()),
            header,
        })
    }

    pub fn header(&self) -> &SetupHeader {
        &self.header
    }

    /// Write the zero page, command line, payload, initrd, E820 map and GDT
    /// into `emulator`'s memory, then program CPU entry state.
    pub fn load(&self, emulator: &mut Emulator) -> Result<()> {
        let mem = emulator.memory_mut();

        // 1. Zero 4 KiB at the zero-page address.
        mem.fill(BOOT_PARAMS_ADDR, 0x1000, 0)?;

        // 2. Copy the real-mode setup stub (the setup header lives inside
        //    it at +0x1F1).
        let setup_len = self.kernel.len().min(0x400);
        mem.write_bytes(BOOT_PARAMS_ADDR, &self.kernel[..setup_len])?;

        // 3. Copy the protected-mode payload.
        let payload_off = (self.header.setup_sects as usize + 1) * 512;
        let payload = if payload_off < self.kernel.len() {
            &self.kernel[payload_off..]
        } else {
            &[]
        };
        mem.write_bytes(PROTECTED_MODE_KERNEL_ADDR, payload)?;

        // 4. Command line, truncated and nul-terminated.
        let cmd_len = self.cmdline.len().min(CMDLINE_MAX);
        mem.write_bytes(CMDLINE_ADDR, &self.cmdline[..cmd_len])?;
        mem.write_u8(CMDLINE_ADDR + cmd_len as u32, 0)?;
        mem.write_u32(BOOT_PARAMS_ADDR + 0x228, CMDLINE_ADDR)?;

        // 5. Initrd, if present.
        if let Some(initrd) = &self.initrd {
            mem.write_bytes(INITRD_ADDR, initrd)?;
            mem.write_u32(BOOT_PARAMS_ADDR + 0x218, INITRD_ADDR)?;
            mem.write_u32(BOOT_PARAMS_ADDR + 0x21C, initrd.len() as u32)?;
        }

        // 6. Loader identity and misc setup-header fields.
        mem.write_u8(BOOT_PARAMS_ADDR + 0x210, 0xFF)?;
        let loadflags = self.header.loadflags | LOADED_HIGH | CAN_USE_HEAP;
        mem.write_u8(BOOT_PARAMS_ADDR + 0x211, loadflags)?;
        mem.write_u16(BOOT_PARAMS_ADDR + 0x224, 0xDE00)?;
        mem.write_u16(BOOT_PARAMS_ADDR + 0x1FA, 0xFFFF)?;
        mem.write_u32(BOOT_PARAMS_ADDR + 0x214, self.header.code32_start)?;

        // 7. E820 map: 0..640KiB RAM, 640KiB..1MiB reserved, 1MiB..end RAM.
        let mem_size = mem.size() as u64;
        let entries = [
            (0u64, 0x9FC00u64, 1u32),
            (0x9FC00, 0x100000 - 0x9FC00, 2),
            (0x100000, mem_size.saturating_sub(0x100000), 1),
        ];
        mem.write_u8(BOOT_PARAMS_ADDR + 0x1E8, entries.len() as u8)?;
        for (i, (addr, size, ty)) in entries.iter().enumerate() {
            let base = BOOT_PARAMS_ADDR + 0x2D0 + (i as u32) * 20;
            mem.write_u32(base, *addr as u32)?;
            mem.write_u32(base + 4, (*addr >> 32) as u32)?;
            mem.write_u32(base + 8, *size as u32)?;
            mem.write_u32(base + 12, (*size >> 32) as u32)?;
            mem.write_u32(base + 16, *ty)?;
        }

        // 8. Minimal GDT: null, flat code, flat data, duplicate flat data.
        const NULL_DESC: [u8; 8] = [0; 8];
        const CODE_DESC: [u8; 8] = [0xFF, 0xFF, 0x00, 0x00, 0x00, 0x9A, 0xCF, 0x00];
        const DATA_DESC: [u8; 8] = [0xFF, 0xFF, 0x00, 0x00, 0x00, 0x92, 0xCF, 0x00];
        mem.write_bytes(GDT_ADDR, &NULL_DESC)?;
        mem.write_bytes(GDT_ADDR + 8, &CODE_DESC)?;
        mem.write_bytes(GDT_ADDR + 16, &DATA_DESC)?;
        mem.write_bytes(GDT_ADDR + 24, &DATA_DESC)?;

        let cpu = emulator.cpu_mut();
        cpu.sys.gdtr.base = GDT_ADDR;
        cpu.sys.gdtr.limit = 31;

        if self.header.loaded_high() {
            log::debug!(
                "entering protected mode at {:#x}, zero page at {:#x}",
                self.header.code32_start,
                BOOT_PARAMS_ADDR
            );
            cpu.sys.cr0 |= CR0_PE;
            let (cpu, mem) = emulator.cpu_mut_and_memory();
            cpu.segs
                .load_protected_mode(SegmentId::Cs, 0x08, GDT_ADDR, 31, mem)?;
            cpu.segs
                .load_protected_mode(SegmentId::Ds, 0x10, GDT_ADDR, 31, mem)?;
            cpu.segs
                .load_protected_mode(SegmentId::Es, 0x10, GDT_ADDR, 31, mem)?;
            cpu.segs
                .load_protected_mode(SegmentId::Fs, 0x10, GDT_ADDR, 31, mem)?;
            cpu.segs
                .load_protected_mode(SegmentId::Gs, 0x10, GDT_ADDR, 31, mem)?;
            cpu.segs
                .load_protected_mode(SegmentId::Ss, 0x10, GDT_ADDR, 31, mem)?;
            cpu.regs.eip = self.header.code32_start;
            cpu.set_reg32(crate::cpu::registers::Reg32::Esi, BOOT_PARAMS_ADDR);
            for reg in [
                crate::cpu::registers::Reg32::Eax,
                crate::cpu::registers::Reg32::Ebx,
                crate::cpu::registers::Reg32::Ecx,
                crate::cpu::registers::Reg32::Edx,
                crate::cpu::registers::Reg32::Edi,
            ] {
                cpu.set_reg32(reg, 0);
            }
            cpu.set_reg32(crate::cpu::registers::Reg32::Ebp, 0);
            cpu.set_reg32(
                crate::cpu::registers::Reg32::Esp,
                BOOT_PARAMS_ADDR.wrapping_sub(0x1000),
            );
            cpu.flags.set_cond(crate::cpu::flags::EFlags::IF, false);
            cpu.flags.set_cond(crate::cpu::flags::EFlags::DF, false);
        } else {
            log::debug!("entering real mode at {:#06x}:0000", REAL_MODE_ENTRY_SEGMENT);
            let base = (REAL_MODE_ENTRY_SEGMENT as u32) << 4;
            cpu.segs.load_real_mode(SegmentId::Cs, REAL_MODE_ENTRY_SEGMENT);
            cpu.segs.load_real_mode(SegmentId::Ds, REAL_MODE_ENTRY_SEGMENT);
            cpu.segs.load_real_mode(SegmentId::Es, REAL_MODE_ENTRY_SEGMENT);
            cpu.segs.load_real_mode(SegmentId::Ss, REAL_MODE_ENTRY_SEGMENT);
            cpu.regs.eip = 0;
            cpu.set_reg32(
                crate::cpu::registers::Reg32::Esi,
                BOOT_PARAMS_ADDR.wrapping_sub(base),
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;

    fn header_buf(loadflags: u8) -> Vec<u8> {
        let mut buf = vec![0u8; 0x400];
        buf[0x1F1] = 4; // setup_sects
        buf[0x1FE..0x200].copy_from_slice(&BOOT_FLAG_MAGIC.to_le_bytes());
        buf[0x202..0x206].copy_from_slice(&HDR_MAGIC.to_le_bytes());
        buf[0x206..0x208].copy_from_slice(&MIN_VERSION.to_le_bytes());
        buf[0x211] = loadflags;
        buf[0x214..0x218].copy_from_slice(&PROTECTED_MODE_KERNEL_ADDR.to_le_bytes());
        buf
    }

    #[test]
    fn parses_a_well_formed_header() {
        let buf = header_buf(LOADED_HIGH);
        let boot = DirectBoot::new(&buf, "console=ttyS0", None).unwrap();
        assert_eq!(boot.header().setup_sects, 4);
        assert_eq!(boot.header().boot_flag, 0xAA55);
        assert_eq!(boot.header().header_magic, HDR_MAGIC);
        assert_eq!(boot.header().code32_start, PROTECTED_MODE_KERNEL_ADDR);
    }

    #[test]
    fn rejects_bad_boot_flag() {
        let mut buf = header_buf(LOADED_HIGH);
        buf[0x1FE] = 0;
        assert!(matches!(
            DirectBoot::new(&buf, "", None),
            Err(EmuError::InvalidBootSector)
        ));
    }

    #[test]
    fn rejects_missing_hdrs_magic() {
        let mut buf = header_buf(LOADED_HIGH);
        buf[0x202] = 0;
        assert!(matches!(
            DirectBoot::new(&buf, "", None),
            Err(EmuError::InvalidBootHeader { .. })
        ));
    }

    #[test]
    fn rejects_too_short_buffer() {
        assert!(matches!(
            DirectBoot::new(&[0u8; 16], "", None),
            Err(EmuError::InvalidKernel { .. })
        ));
    }

    #[test]
    fn full_kernel_load_lands_in_protected_mode_at_entry() {
        let buf = header_buf(LOADED_HIGH);
        let boot = DirectBoot::new(&buf, "console=ttyS0", None).unwrap();
        let mut emu = Emulator::new(Config::default());
        boot.load(&mut emu).unwrap();

        let state = emu.get_cpu_state();
        assert_eq!(state.mode, crate::cpu::sysregs::Mode::Protected);
        assert!(state.cr0 & CR0_PE != 0);
        assert_eq!(state.segs.cs.selector, 0x08);
        assert_eq!(state.segs.ds.selector, 0x10);
        assert_eq!(state.esi, BOOT_PARAMS_ADDR);
        assert_eq!(state.eip, PROTECTED_MODE_KERNEL_ADDR);
        assert_eq!(state.gdtr.base, GDT_ADDR);
        assert_eq!(state.gdtr.limit, 31);

        let mem = emu.memory();
        assert_eq!(mem.read_u16(BOOT_PARAMS_ADDR + 0x1FE).unwrap(), 0xAA55);
        let cmd = mem.read_bytes(CMDLINE_ADDR, 13).unwrap();
        assert_eq!(cmd, b"console=ttyS0");
        assert_eq!(mem.read_u8(CMDLINE_ADDR + 13).unwrap(), 0);
    }

    #[test]
    fn real_mode_entry_when_not_loaded_high() {
        let buf = header_buf(0);
        let boot = DirectBoot::new(&buf, "", None).unwrap();
        let mut emu = Emulator::new(Config::default());
        boot.load(&mut emu).unwrap();

        let state = emu.get_cpu_state();
        assert_eq!(state.mode, crate::cpu::sysregs::Mode::Real);
        assert_eq!(state.segs.cs.selector, REAL_MODE_ENTRY_SEGMENT);
        assert_eq!(state.eip, 0);
    }
}
