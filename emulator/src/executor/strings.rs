//! String instructions: MOVS/CMPS/STOS/LODS/SCAS, with REP/REPE/REPNE.
//!
//! DF drives the per-element step direction; REP loops the whole
//! instruction in place by re-running this function with the same decoded
//! `Instruction` until ECX (or the REPE/REPNE zero-flag condition) says
//! stop, so the caller only ever advances EIP once the repetition ends.

use crate::cpu::flags::{self, EFlags, Width};
use crate::cpu::registers::Reg32;
use crate::cpu::segments::SegmentId;
use crate::cpu::Cpu;
use crate::decoder::{Operand, RepKind, StringOp};
use crate::error::Result;
use crate::memory::Memory;

fn step_delta(cpu: &Cpu, width: Width) -> i32 {
    let step = (width.bits() / 8) as i32;
    if cpu.flags.test(EFlags::DF) {
        -step
    } else {
        step
    }
}

fn advance(reg_value: u32, delta: i32) -> u32 {
    reg_value.wrapping_add(delta as u32)
}

fn one_iteration(cpu: &mut Cpu, mem: &mut Memory, op: StringOp, width: Width, src_seg: SegmentId) -> Result<()> {
    let delta = step_delta(cpu, width);
    match op {
        StringOp::Movs => {
            let si = cpu.get_reg32(Reg32::Esi);
            let di = cpu.get_reg32(Reg32::Edi);
            let value = Operand::Mem { seg: src_seg, offset: si, width }.read(cpu, mem)?;
            Operand::Mem { seg: SegmentId::Es, offset: di, width }.write(cpu, mem, value)?;
            cpu.set_reg32(Reg32::Esi, advance(si, delta));
            cpu.set_reg32(Reg32::Edi, advance(di, delta));
        }
        StringOp::Cmps => {
            let si = cpu.get_reg32(Reg32::Esi);
            let di = cpu.get_reg32(Reg32::Edi);
            let lhs = Operand::Mem { seg: src_seg, offset: si, width }.read(cpu, mem)?;
            let rhs = Operand::Mem { seg: SegmentId::Es, offset: di, width }.read(cpu, mem)?;
            flags::sub_flags(&mut cpu.flags, lhs, rhs, lhs as i64 - rhs as i64, width);
            cpu.set_reg32(Reg32::Esi, advance(si, delta));
            cpu.set_reg32(Reg32::Edi, advance(di, delta));
        }
        StringOp::Stos => {
            let di = cpu.get_reg32(Reg32::Edi);
            let value = Operand::Reg(Reg32::Eax, width).read(cpu, mem)?;
            Operand::Mem { seg: SegmentId::Es, offset: di, width }.write(cpu, mem, value)?;
            cpu.set_reg32(Reg32::Edi, advance(di, delta));
        }
        StringOp::Lods => {
            let si = cpu.get_reg32(Reg32::Esi);
            let value = Operand::Mem { seg: src_seg, offset: si, width }.read(cpu, mem)?;
            Operand::Reg(Reg32::Eax, width).write(cpu, mem, value)?;
            cpu.set_reg32(Reg32::Esi, advance(si, delta));
        }
        StringOp::Scas => {
            let di = cpu.get_reg32(Reg32::Edi);
            let lhs = Operand::Reg(Reg32::Eax, width).read(cpu, mem)?;
            let rhs = Operand::Mem { seg: SegmentId::Es, offset: di, width }.read(cpu, mem)?;
            flags::sub_flags(&mut cpu.flags, lhs, rhs, lhs as i64 - rhs as i64, width);
            cpu.set_reg32(Reg32::Edi, advance(di, delta));
        }
    }
    Ok(())
}

pub fn execute(
    cpu: &mut Cpu,
    mem: &mut Memory,
    op: StringOp,
    width: Width,
    rep: Option<RepKind>,
    seg_override: Option<SegmentId>,
    next_eip: u32,
) -> Result<super::Flow> {
    let src_seg = seg_override.unwrap_or(SegmentId::Ds);
    match rep {
        None => {
            one_iteration(cpu, mem, op, width, src_seg)?;
        }
        Some(kind) => {
            let terminates_on_zf = matches!(op, StringOp::Cmps | StringOp::Scas);
            loop {
                let ecx = cpu.get_reg32(Reg32::Ecx);
                if ecx == 0 {
                    break;
                }
                one_iteration(cpu, mem, op, width, src_seg)?;
                cpu.set_reg32(Reg32::Ecx, ecx - 1);
                if terminates_on_zf {
                    let zf = cpu.flags.test(EFlags::ZF);
                    let stop = match kind {
                        RepKind::Rep => !zf,
                        RepKind::Repne => zf,
                    };
                    if stop {
                        break;
                    }
                }
                if cpu.get_reg32(Reg32::Ecx) == 0 {
                    break;
                }
            }
        }
    }
    cpu.regs.eip = next_eip;
    Ok(super::Flow::Jumped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Memory;

    #[test]
    fn rep_movsb_copies_ecx_bytes_forward() {
        let mut cpu = Cpu::new();
        let mut mem = Memory::new(256);
        mem.write_bytes(0, b"hello world").unwrap();
        cpu.set_reg32(Reg32::Esi, 0);
        cpu.set_reg32(Reg32::Edi, 0x40);
        cpu.set_reg32(Reg32::Ecx, 11);
        execute(&mut cpu, &mut mem, StringOp::Movs, Width::Byte, Some(RepKind::Rep), None, 0x10).unwrap();
        assert_eq!(mem.read_bytes(0x40, 11).unwrap(), b"hello world");
        assert_eq!(cpu.get_reg32(Reg32::Ecx), 0);
        assert_eq!(cpu.regs.eip, 0x10);
    }

    #[test]
    fn rep_movsb_direction_reverses_with_df() {
        let mut cpu = Cpu::new();
        let mut mem = Memory::new(256);
        cpu.flags.set_cond(EFlags::DF, true);
        mem.write_bytes(0, b"AB").unwrap();
        cpu.set_reg32(Reg32::Esi, 1);
        cpu.set_reg32(Reg32::Edi, 0x21);
        cpu.set_reg32(Reg32::Ecx, 2);
        execute(&mut cpu, &mut mem, StringOp::Movs, Width::Byte, Some(RepKind::Rep), None, 0).unwrap();
        assert_eq!(mem.read_u8(0x21).unwrap(), b'B');
        assert_eq!(mem.read_u8(0x20).unwrap(), b'A');
    }

    #[test]
    fn segment_override_wins_over_default_ds_source() {
        let mut cpu = Cpu::new();
        let mut mem = Memory::new(0x2000);
        cpu.segs.load_real_mode(SegmentId::Fs, 0x0100); // base 0x1000
        mem.write_u8(0x1000, 0x7A).unwrap();
        cpu.set_reg32(Reg32::Esi, 0);
        execute(&mut cpu, &mut mem, StringOp::Lods, Width::Byte, None, Some(SegmentId::Fs), 0).unwrap();
        assert_eq!(cpu.get_reg32(Reg32::Eax) & 0xFF, 0x7A);
    }
}
