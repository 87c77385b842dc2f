//! Control flow: JMP/Jcc, CALL/RET, INT/IRET, LOOP family.

use crate::cpu::flags::{EFlags, Width};
use crate::cpu::registers::Reg32;
use crate::cpu::segments::SegmentId;
use crate::cpu::sysregs::Mode;
use crate::cpu::Cpu;
use crate::decoder::{Cond, JmpTarget, LoopKind, Operand};
use crate::error::Result;
use crate::memory::Memory;

use super::stack::{pop_value, push_value};
use super::Flow;

fn eval_cond(flags: &EFlags, cond: Cond) -> bool {
    let cf = flags.test(EFlags::CF);
    let zf = flags.test(EFlags::ZF);
    let sf = flags.test(EFlags::SF);
    let of = flags.test(EFlags::OF);
    let pf = flags.test(EFlags::PF);
    match cond {
        Cond::O => of,
        Cond::No => !of,
        Cond::B => cf,
        Cond::Nb => !cf,
        Cond::E => zf,
        Cond::Ne => !zf,
        Cond::Be => cf || zf,
        Cond::Nbe => !cf && !zf,
        Cond::S => sf,
        Cond::Ns => !sf,
        Cond::P => pf,
        Cond::Np => !pf,
        Cond::L => sf != of,
        Cond::Nl => sf == of,
        Cond::Le => zf || (sf != of),
        Cond::Nle => !zf && (sf == of),
    }
}

pub fn jmp(cpu: &mut Cpu, mem: &Memory, target: &JmpTarget) -> Result<Flow> {
    match *target {
        JmpTarget::Relative(rel) => {
            cpu.regs.eip = cpu.regs.eip.wrapping_add(rel as u32);
        }
        JmpTarget::Indirect(reg) => {
            cpu.regs.eip = cpu.get_reg32(reg);
        }
        JmpTarget::IndirectMem { seg, offset, width } => {
            cpu.regs.eip = Operand::Mem { seg, offset, width }.read(cpu, mem)?;
        }
        JmpTarget::Far { selector, offset } => {
            far_jump(cpu, mem, selector, offset)?;
        }
        JmpTarget::FarIndirectMem { seg, offset } => {
            let new_offset = Operand::Mem { seg, offset, width: Width::Dword }.read(cpu, mem)?;
            let selector = Operand::Mem { seg, offset: offset + 4, width: Width::Word }.read(cpu, mem)? as u16;
            far_jump(cpu, mem, selector, new_offset)?;
        }
    }
    Ok(Flow::Jumped)
}

fn far_jump(cpu: &mut Cpu, mem: &Memory, selector: u16, offset: u32) -> Result<()> {
    match cpu.mode() {
        Mode::Real => cpu.segs.load_real_mode(SegmentId::Cs, selector),
        Mode::Protected => {
            let gdtr = cpu.sys.gdtr;
            cpu.segs
                .load_protected_mode(SegmentId::Cs, selector, gdtr.base, gdtr.limit as u32, mem)?;
        }
    }
    cpu.regs.eip = offset;
    Ok(())
}

pub fn jcc(cpu: &mut Cpu, cond: Cond, rel: i32, next_eip: u32) -> Result<Flow> {
    if eval_cond(&cpu.flags, cond) {
        cpu.regs.eip = next_eip.wrapping_add(rel as u32);
    } else {
        cpu.regs.eip = next_eip;
    }
    Ok(Flow::Jumped)
}

pub fn call_near(cpu: &mut Cpu, mem: &mut Memory, rel: i32, next_eip: u32) -> Result<Flow> {
    push_value(cpu, mem, next_eip, Width::Dword)?;
    cpu.regs.eip = next_eip.wrapping_add(rel as u32);
    Ok(Flow::Jumped)
}

pub fn call_near_indirect(cpu: &mut Cpu, mem: &mut Memory, target: &Operand, next_eip: u32) -> Result<Flow> {
    let new_eip = target.read(cpu, mem)?;
    push_value(cpu, mem, next_eip, Width::Dword)?;
    cpu.regs.eip = new_eip;
    Ok(Flow::Jumped)
}

pub fn call_far(cpu: &mut Cpu, mem: &mut Memory, selector: u16, offset: u32, next_eip: u32) -> Result<Flow> {
    let old_cs = cpu.segs.get(SegmentId::Cs).selector;
    push_value(cpu, mem, old_cs as u32, Width::Word)?;
    push_value(cpu, mem, next_eip, Width::Dword)?;
    far_jump(cpu, mem, selector, offset)?;
    Ok(Flow::Jumped)
}

/// `CALL FAR [mem]`: the far pointer (offset:selector, 6 bytes) lives in
/// memory at `seg:offset` rather than in the instruction itself, unlike
/// [`call_far`].
pub fn call_far_indirect(cpu: &mut Cpu, mem: &mut Memory, seg: SegmentId, offset: u32, next_eip: u32) -> Result<Flow> {
    let new_offset = Operand::Mem { seg, offset, width: Width::Dword }.read(cpu, mem)?;
    let selector = Operand::Mem { seg, offset: offset + 4, width: Width::Word }.read(cpu, mem)? as u16;
    call_far(cpu, mem, selector, new_offset, next_eip)
}

pub fn ret_near(cpu: &mut Cpu, mem: &mut Memory, pop_bytes: u16) -> Result<Flow> {
    let eip = pop_value(cpu, mem, Width::Dword)?;
    let esp = cpu.get_reg32(Reg32::Esp).wrapping_add(pop_bytes as u32);
    cpu.set_reg32(Reg32::Esp, esp);
    cpu.regs.eip = eip;
    Ok(Flow::Jumped)
}

pub fn ret_far(cpu: &mut Cpu, mem: &mut Memory, pop_bytes: u16) -> Result<Flow> {
    let eip = pop_value(cpu, mem, Width::Dword)?;
    let selector = pop_value(cpu, mem, Width::Word)? as u16;
    let esp = cpu.get_reg32(Reg32::Esp).wrapping_add(pop_bytes as u32);
    cpu.set_reg32(Reg32::Esp, esp);
    far_jump(cpu, mem, selector, eip)?;
    Ok(Flow::Jumped)
}

/// `INT n`: pushes FLAGS, CS, EIP and vectors through the IVT (real mode,
/// 4-byte entries at `n*4`) or the IDT (protected mode, 8-byte gates at
/// `idtr.base + n*8`, offset split low16/high16 around the selector word
/// the way a real interrupt gate packs it). The pushed frame is 16-bit
/// wide in real mode and dword-padded (FLAGS/CS/EIP each a full dword) in
/// protected mode, matching `call_far`'s mixed-width convention.
pub fn int(cpu: &mut Cpu, mem: &mut Memory, vector: u8, next_eip: u32) -> Result<Flow> {
    let frame_width = match cpu.mode() {
        Mode::Real => Width::Word,
        Mode::Protected => Width::Dword,
    };
    push_value(cpu, mem, cpu.flags.bits(), frame_width)?;
    let cs = cpu.segs.get(SegmentId::Cs).selector;
    push_value(cpu, mem, cs as u32, frame_width)?;
    push_value(cpu, mem, next_eip, frame_width)?;
    cpu.flags.set_cond(EFlags::IF, false);
    cpu.flags.set_cond(EFlags::TF, false);

    match cpu.mode() {
        Mode::Real => {
            let entry = (vector as u32) * 4;
            let offset = mem.read_u16(entry)? as u32;
            let selector = mem.read_u16(entry + 2)?;
            cpu.segs.load_real_mode(SegmentId::Cs, selector);
            cpu.regs.eip = offset;
        }
        Mode::Protected => {
            let gate = cpu.sys.idtr.base.wrapping_add(vector as u32 * 8);
            let offset_low = mem.read_u16(gate)? as u32;
            let selector = mem.read_u16(gate + 2)?;
            let offset_high = mem.read_u16(gate + 6)? as u32;
            cpu.segs
                .load_protected_mode(SegmentId::Cs, selector, cpu.sys.gdtr.base, cpu.sys.gdtr.limit as u32, mem)?;
            cpu.regs.eip = (offset_high << 16) | offset_low;
        }
    }
    Ok(Flow::Jumped)
}

pub fn iret(cpu: &mut Cpu, mem: &mut Memory) -> Result<Flow> {
    let frame_width = match cpu.mode() {
        Mode::Real => Width::Word,
        Mode::Protected => Width::Dword,
    };
    let eip = pop_value(cpu, mem, frame_width)?;
    let selector = pop_value(cpu, mem, frame_width)? as u16;
    let flags_word = pop_value(cpu, mem, frame_width)?;
    cpu.flags = EFlags::from_bits_truncate(flags_word) | EFlags::RESERVED1;
    match cpu.mode() {
        Mode::Real => cpu.segs.load_real_mode(SegmentId::Cs, selector),
        Mode::Protected => {
            let gdtr = cpu.sys.gdtr;
            cpu.segs
                .load_protected_mode(SegmentId::Cs, selector, gdtr.base, gdtr.limit as u32, mem)?;
        }
    }
    cpu.regs.eip = eip;
    Ok(Flow::Jumped)
}

pub fn loop_instr(cpu: &mut Cpu, kind: LoopKind, rel: i32, next_eip: u32) -> Result<Flow> {
    let ecx = cpu.get_reg32(Reg32::Ecx).wrapping_sub(1);
    cpu.set_reg32(Reg32::Ecx, ecx);
    let zf = cpu.flags.test(EFlags::ZF);
    let take = match kind {
        LoopKind::Loop => ecx != 0,
        LoopKind::LoopWhileZero => ecx != 0 && zf,
        LoopKind::LoopWhileNotZero => ecx != 0 && !zf,
    };
    cpu.regs.eip = if take { next_eip.wrapping_add(rel as u32) } else { next_eip };
    Ok(Flow::Jumped)
}
