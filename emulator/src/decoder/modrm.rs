//! ModR/M + SIB + displacement decoding (decoder step 3/5).
//!
//! Generalizes `decode_mmio_instruction`'s REX/ModR/M walk from its single
//! MOV-family case to full effective-address computation, including the
//! 16-bit addressing table i686 real mode still needs and the `mod=00,
//! rm=5`/`SIB.base=5` absolute-disp32 special case a REX-only decoder
//! never has to handle.

use crate::cpu::registers::{Reg32, Registers};
use crate::cpu::segments::SegmentId;
use crate::error::{EmuError, Result};

use super::prefixes::Prefixes;

pub struct ModRm {
    pub is_memory: bool,
    pub reg_field: u8,
    /// Valid when `is_memory` is false: the rm-field register.
    pub rm_reg: Reg32,
    /// Valid when `is_memory` is true.
    pub mem_segment: SegmentId,
    pub mem_offset: u32,
    pub consumed: usize,
}

fn sib_base_index(
    sib: u8,
    regs: &Registers,
    mod_field: u8,
    bytes: &[u8],
    mut consumed: usize,
) -> Result<(u32, bool, usize)> {
    let scale = 1u32 << (sib >> 6);
    let index = (sib >> 3) & 0x07;
    let base = sib & 0x07;

    let index_value = if index == 4 {
        0 // ESP as index field means "no index"
    } else {
        regs.get32(Reg32::from_index(index))
    };

    let (base_value, base_is_disp32) = if base == 5 && mod_field == 0 {
        (0, true)
    } else {
        (regs.get32(Reg32::from_index(base)), false)
    };

    let mut offset = base_value.wrapping_add(index_value.wrapping_mul(scale));
    if base_is_disp32 {
        if bytes.len() < consumed + 4 {
            return Err(EmuError::DecodeUnderflow {
                address: 0,
                needed: 4,
            });
        }
        let disp = i32::from_le_bytes([
            bytes[consumed],
            bytes[consumed + 1],
            bytes[consumed + 2],
            bytes[consumed + 3],
        ]);
        offset = offset.wrapping_add(disp as u32);
        consumed += 4;
    }
    Ok((offset, base == 5, consumed))
}

/// 16-bit addressing-mode base/index table for rm 0..=7 (mod != 11).
fn addr16_base(rm: u8, regs: &Registers) -> (u32, bool) {
    let bx = regs.get16(Reg32::Ebx) as u32;
    let bp = regs.get16(Reg32::Ebp) as u32;
    let si = regs.get16(Reg32::Esi) as u32;
    let di = regs.get16(Reg32::Edi) as u32;
    match rm {
        0 => (bx.wrapping_add(si), false),
        1 => (bx.wrapping_add(di), false),
        2 => (bp.wrapping_add(si), true),
        3 => (bp.wrapping_add(di), true),
        4 => (si, false),
        5 => (di, false),
        6 => (bp, true),
        _ => (bx, false),
    }
}

/// Decodes the ModR/M byte (and SIB/displacement if present) from `bytes`.
/// `addr_size_32` reflects the current effective address size (0x67 XORs
/// the mode default). Register operands resolve eagerly against `regs`
/// since this decoder has no pipelining: decode happens immediately before
/// execute.
pub fn decode_modrm(
    bytes: &[u8],
    prefixes: &Prefixes,
    addr_size_32: bool,
    regs: &Registers,
) -> Result<ModRm> {
    if bytes.is_empty() {
        return Err(EmuError::DecodeUnderflow {
            address: 0,
            needed: 1,
        });
    }
    let modrm = bytes[0];
    let mod_field = modrm >> 6;
    let reg_field = (modrm >> 3) & 0x07;
    let rm_field = modrm & 0x07;
    let mut consumed = 1;

    if mod_field == 0b11 {
        return Ok(ModRm {
            is_memory: false,
            reg_field,
            rm_reg: Reg32::from_index(rm_field),
            mem_segment: SegmentId::Ds,
            mem_offset: 0,
            consumed,
        });
    }

    let default_seg;
    let mut offset;

    if addr_size_32 {
        if rm_field == 4 {
            if bytes.len() < consumed + 1 {
                return Err(EmuError::DecodeUnderflow {
                    address: 0,
                    needed: 1,
                });
            }
            let sib = bytes[consumed];
            consumed += 1;
            let base_field = sib & 0x07;
            let (o, used_bp_like, new_consumed) =
                sib_base_index(sib, regs, mod_field, bytes, consumed)?;
            consumed = new_consumed;
            offset = o;
            default_seg = if base_field == 5 && mod_field == 0 {
                SegmentId::Ds
            } else if base_field == 5 {
                SegmentId::Ss
            } else {
                let _ = used_bp_like;
                SegmentId::Ds
            };
        } else if rm_field == 5 && mod_field == 0 {
            if bytes.len() < consumed + 4 {
                return Err(EmuError::DecodeUnderflow {
                    address: 0,
                    needed: 4,
                });
            }
            offset = u32::from_le_bytes([
                bytes[consumed],
                bytes[consumed + 1],
                bytes[consumed + 2],
                bytes[consumed + 3],
            ]);
            consumed += 4;
            default_seg = SegmentId::Ds;
        } else {
            offset = regs.get32(Reg32::from_index(rm_field));
            default_seg = if rm_field == 5 {
                SegmentId::Ss
            } else {
                SegmentId::Ds
            };
        }
    } else {
        if rm_field == 6 && mod_field == 0 {
            if bytes.len() < consumed + 2 {
                return Err(EmuError::DecodeUnderflow {
                    address: 0,
                    needed: 2,
                });
            }
            offset = u16::from_le_bytes([bytes[consumed], bytes[consumed + 1]]) as u32;
            consumed += 2;
            default_seg = SegmentId::Ds;
        } else {
            let (base, uses_bp) = addr16_base(rm_field, regs);
            offset = base;
            default_seg = if uses_bp { SegmentId::Ss } else { SegmentId::Ds };
        }
    }

    match mod_field {
        0b01 => {
            if bytes.len() < consumed + 1 {
                return Err(EmuError::DecodeUnderflow {
                    address: 0,
                    needed: 1,
                });
            }
            let disp = bytes[consumed] as i8 as i32;
            consumed += 1;
            offset = offset.wrapping_add(disp as u32);
        }
        0b10 => {
            if addr_size_32 {
                if bytes.len() < consumed + 4 {
                    return Err(EmuError::DecodeUnderflow {
                        address: 0,
                        needed: 4,
                    });
                }
                let disp = i32::from_le_bytes([
                    bytes[consumed],
                    bytes[consumed + 1],
                    bytes[consumed + 2],
                    bytes[consumed + 3],
                ]);
                consumed += 4;
                offset = offset.wrapping_add(disp as u32);
            } else {
                if bytes.len() < consumed + 2 {
                    return Err(EmuError::DecodeUnderflow {
                        address: 0,
                        needed: 2,
                    });
                }
                let disp = i16::from_le_bytes([bytes[consumed], bytes[consumed + 1]]) as i32;
                consumed += 2;
                offset = offset.wrapping_add(disp as u32);
            }
        }
        _ => {}
    }

    if !addr_size_32 {
        offset &= 0xFFFF;
    }

    let mem_segment = prefixes.segment_override.unwrap_or(default_seg);

    Ok(ModRm {
        is_memory: true,
        reg_field,
        rm_reg: Reg32::Eax,
        mem_segment,
        mem_offset: offset,
        consumed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_direct_mode_consumes_one_byte() {
        let regs = Registers::new();
        let prefixes = Prefixes::default();
        // mod=11 reg=000 rm=001 -> EAX, ECX
        let result = decode_modrm(&[0b1100_0001], &prefixes, true, &regs).unwrap();
        assert!(!result.is_memory);
        assert_eq!(result.reg_field, 0);
        assert_eq!(result.rm_reg, Reg32::Ecx);
        assert_eq!(result.consumed, 1);
    }

    #[test]
    fn disp32_absolute_mode00_rm5_32bit() {
        let regs = Registers::new();
        let prefixes = Prefixes::default();
        // mod=00 reg=000 rm=101, then 4-byte disp.
        let bytes = [0b0000_0101, 0x00, 0x00, 0x10, 0x00];
        let result = decode_modrm(&bytes, &prefixes, true, &regs).unwrap();
        assert!(result.is_memory);
        assert_eq!(result.mem_offset, 0x0010_0000);
        assert_eq!(result.consumed, 5);
    }

    #[test]
    fn addr16_mode00_rm6_is_disp16_absolute() {
        let regs = Registers::new();
        let prefixes = Prefixes::default();
        let bytes = [0b0000_0110, 0x00, 0x02];
        let result = decode_modrm(&bytes, &prefixes, false, &regs).unwrap();
        assert!(result.is_memory);
        assert_eq!(result.mem_offset, 0x0200);
        assert_eq!(result.consumed, 3);
    }

    #[test]
    fn bp_based_addressing_defaults_to_ss() {
        let mut regs = Registers::new();
        regs.set16(Reg32::Ebp, 0x10);
        let prefixes = Prefixes::default();
        // mod=01 rm=110 (BP + disp8), disp8 = 4.
        let bytes = [0b0100_0110, 0x04];
        let result = decode_modrm(&bytes, &prefixes, false, &regs).unwrap();
        assert_eq!(result.mem_segment, SegmentId::Ss);
        assert_eq!(result.mem_offset, 0x14);
    }
}
