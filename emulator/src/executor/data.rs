//! Data movement: MOV, LEA, segment loads and far pointer loads.

use crate::cpu::flags::Width;
use crate::cpu::registers::Reg32;
use crate::cpu::segments::SegmentId;
use crate::cpu::Cpu;
use crate::cpu::sysregs::Mode;
use crate::decoder::Operand;
use crate::error::Result;
use crate::memory::Memory;

pub fn mov(cpu: &mut Cpu, mem: &mut Memory, dst: &Operand, src: &Operand) -> Result<()> {
    let value = src.read(cpu, mem)?;
    dst.write(cpu, mem, value)
}

/// LEA never touches memory: the effective address itself is the value.
pub fn lea(cpu: &mut Cpu, dst: Reg32, offset: u32) -> Result<()> {
    cpu.regs.set32(dst, offset);
    Ok(())
}

fn reload_segment(cpu: &mut Cpu, mem: &Memory, seg: SegmentId, selector: u16) -> Result<()> {
    match cpu.mode() {
        Mode::Real => {
            cpu.segs.load_real_mode(seg, selector);
            Ok(())
        }
        Mode::Protected => {
            let gdtr = cpu.sys.gdtr;
            cpu.segs
                .load_protected_mode(seg, selector, gdtr.base, gdtr.limit as u32, mem)
        }
    }
}

pub fn load_seg_reg(cpu: &mut Cpu, mem: &mut Memory, seg: SegmentId, src: &Operand) -> Result<()> {
    let selector = src.read(cpu, mem)? as u16;
    reload_segment(cpu, mem, seg, selector)
}

pub fn store_seg_reg(cpu: &mut Cpu, mem: &mut Memory, seg: SegmentId, dst: &Operand) -> Result<()> {
    let selector = cpu.segs.get(seg).selector;
    dst.write(cpu, mem, selector as u32)
}

/// LES/LDS/LFS/LGS/LSS: read a far pointer (offset then selector) from
/// memory, load the offset into `dst` and the selector into `seg`'s cache.
pub fn load_far_ptr(
    cpu: &mut Cpu,
    mem: &mut Memory,
    dst: Reg32,
    seg: SegmentId,
    mem_seg: SegmentId,
    offset: u32,
    width: Width,
) -> Result<()> {
    let ptr_offset = Operand::Mem { seg: mem_seg, offset, width }.read(cpu, mem)?;
    let selector_offset = offset.wrapping_add(width.bits() / 8);
    let selector = Operand::Mem { seg: mem_seg, offset: selector_offset, width: Width::Word }.read(cpu, mem)? as u16;
    cpu.regs.set32(dst, ptr_offset);
    reload_segment(cpu, mem, seg, selector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::IoBus;

    #[test]
    fn mov_immediate_to_register() {
        let mut cpu = Cpu::new();
        let mut mem = Memory::new(16);
        let _io = IoBus::new();
        mov(&mut cpu, &mut mem, &Operand::Reg(Reg32::Eax, Width::Dword), &Operand::Imm(42)).unwrap();
        assert_eq!(cpu.get_reg32(Reg32::Eax), 42);
    }

    #[test]
    fn lea_computes_address_without_memory_access() {
        let mut cpu = Cpu::new();
        lea(&mut cpu, Reg32::Ebx, 0x1234).unwrap();
        assert_eq!(cpu.get_reg32(Reg32::Ebx), 0x1234);
    }

    #[test]
    fn load_seg_reg_in_real_mode_sets_flat_base() {
        let mut cpu = Cpu::new();
        let mut mem = Memory::new(16);
        load_seg_reg(&mut cpu, &mut mem, SegmentId::Ds, &Operand::Imm(0x1000)).unwrap();
        assert_eq!(cpu.segs.get(SegmentId::Ds).cache.base, 0x10000);
    }
}
