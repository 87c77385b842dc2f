//! Executes one decoded [`Instruction`](crate::decoder::Instruction),
//! mutating `Cpu`, `Memory` and the I/O bus, then advances `EIP`.
//!
//! `nes::cpu::step` is one big `match opcode` closing over `&mut Cpu` and
//! `&mut impl CpuBus`; this keeps that same "one big match, mutate in
//! place" shape but over the decoder's typed `Instruction` instead of a
//! raw opcode byte, with the per-group semantics split across sibling
//! modules by instruction family (arith/logic/control/strings/stack/I-O/
//! system).

mod arith;
mod control;
mod data;
mod ioinstr;
mod stack;
mod strings;
mod system;

use crate::cpu::Cpu;
use crate::decoder::Instruction;
use crate::error::Result;
use crate::io::IoBus;
use crate::memory::Memory;

/// Whether the instruction set `EIP` itself (branches) or wants the
/// default "advance past the decoded bytes" behavior.
pub(crate) enum Flow {
    Next,
    Jumped,
}

pub fn execute(
    cpu: &mut Cpu,
    mem: &mut Memory,
    io: &mut IoBus,
    instr: &Instruction,
    length: u8,
) -> Result<()> {
    let next_eip = cpu.regs.eip.wrapping_add(length as u32);
    let flow = dispatch(cpu, mem, io, instr, next_eip)?;
    if let Flow::Next = flow {
        cpu.regs.eip = next_eip;
    }
    Ok(())
}

fn dispatch(
    cpu: &mut Cpu,
    mem: &mut Memory,
    io: &mut IoBus,
    instr: &Instruction,
    next_eip: u32,
) -> Result<Flow> {
    use Instruction::*;
    match instr {
        Mov { dst, src } => data::mov(cpu, mem, dst, src),
        Lea { dst, seg: _, offset } => data::lea(cpu, *dst, *offset),
        LoadSegReg { seg, src } => data::load_seg_reg(cpu, mem, *seg, src),
        StoreSegReg { seg, dst } => data::store_seg_reg(cpu, mem, *seg, dst),
        LoadFarPtr { dst, seg, mem_seg, offset, width } => {
            data::load_far_ptr(cpu, mem, *dst, *seg, *mem_seg, *offset, *width)
        }
        Push { src } => stack::push_operand(cpu, mem, src),
        Pop { dst } => stack::pop_operand(cpu, mem, dst),
        Alu { op, dst, src } => arith::alu(cpu, mem, *op, dst, src),
        Test { dst, src } => arith::test(cpu, mem, dst, src),
        Inc { dst } => arith::inc(cpu, mem, dst),
        Dec { dst } => arith::dec(cpu, mem, dst),
        Neg { dst } => arith::neg(cpu, mem, dst),
        Not { dst } => arith::not(cpu, mem, dst),
        Mul { src } => arith::mul(cpu, mem, src),
        Imul { src } => arith::imul(cpu, mem, src),
        Div { src } => arith::div(cpu, mem, src),
        Idiv { src } => arith::idiv(cpu, mem, src),
        Shift { op, dst, count } => arith::shift(cpu, mem, *op, dst, *count),
        Jmp { target } => return control::jmp(cpu, mem, target),
        Jcc { cond, rel } => return control::jcc(cpu, *cond, *rel, next_eip),
        CallNear { rel } => return control::call_near(cpu, mem, *rel, next_eip),
        CallNearIndirect { target } => return control::call_near_indirect(cpu, mem, target, next_eip),
        CallFar { selector, offset } => return control::call_far(cpu, mem, *selector, *offset, next_eip),
        CallFarIndirectMem { seg, offset } => return control::call_far_indirect(cpu, mem, *seg, *offset, next_eip),
        RetNear { pop_bytes } => return control::ret_near(cpu, mem, *pop_bytes),
        RetFar { pop_bytes } => return control::ret_far(cpu, mem, *pop_bytes),
        Int { vector } => return control::int(cpu, mem, *vector, next_eip),
        Iret => return control::iret(cpu, mem),
        Loop { kind, rel } => return control::loop_instr(cpu, *kind, *rel, next_eip),
        StringOp { op, width, rep, seg_override } => {
            return strings::execute(cpu, mem, *op, *width, *rep, *seg_override, next_eip)
        }
        Enter { alloc, level } => stack::enter(cpu, mem, *alloc, *level),
        Leave => stack::leave(cpu, mem),
        In { port, width } => ioinstr::input(cpu, io, *port, *width),
        Out { port, width } => ioinstr::output(cpu, io, *port, *width),
        Nop => Ok(()),
        Hlt => {
            cpu.halted = true;
            Ok(())
        }
        Cli => { cpu.flags.set_cond(crate::cpu::flags::EFlags::IF, false); Ok(()) }
        Sti => { cpu.flags.set_cond(crate::cpu::flags::EFlags::IF, true); Ok(()) }
        Cld => { cpu.flags.set_cond(crate::cpu::flags::EFlags::DF, false); Ok(()) }
        Std => { cpu.flags.set_cond(crate::cpu::flags::EFlags::DF, true); Ok(()) }
        Cpuid => system::cpuid(cpu),
        Rdtsc => system::rdtsc(cpu),
        Group7 { op, operand } => system::group7(cpu, mem, *op, operand),
        Group6 { op, operand } => system::group6(cpu, mem, *op, operand),
        Rdmsr => system::rdmsr(cpu),
        Wrmsr => system::wrmsr(cpu),
        Sysenter => return system::sysenter(cpu),
        Sysexit => return system::sysexit(cpu),
    }
    .map(|_| Flow::Next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::registers::Reg32;
    use crate::decoder::{decode, Operand};
    use crate::memory::Memory;

    fn run_one(cpu: &mut Cpu, mem: &mut Memory, io: &mut IoBus) {
        let addr = cpu.cs_eip_linear();
        let bytes = mem.read_bytes(addr, 16.min(mem.size() - addr as usize)).unwrap().to_vec();
        let (instr, len) = decode(&bytes, addr, &cpu.regs, cpu.mode() == crate::cpu::sysregs::Mode::Protected).unwrap();
        execute(cpu, mem, io, &instr, len).unwrap();
    }

    #[test]
    fn mov_push_pop_round_trip() {
        let mut cpu = Cpu::new();
        let mut mem = Memory::new(4096);
        let mut io = IoBus::new();
        // MOV EAX,0x44332211; PUSH EAX; POP EBX; HLT
        let program = [0xB8, 0x11, 0x22, 0x33, 0x44, 0x50, 0x5B, 0xF4];
        mem.write_bytes(0, &program).unwrap();
        cpu.segs.load_real_mode(crate::cpu::segments::SegmentId::Ss, 0x2000);
        cpu.set_reg32(Reg32::Esp, 0x1000);

        while !cpu.halted {
            run_one(&mut cpu, &mut mem, &mut io);
        }
        assert_eq!(cpu.get_reg32(Reg32::Ebx), 0x4433_2211);
        assert_eq!(cpu.get_reg32(Reg32::Esp), 0x1000);
    }

    #[test]
    fn operand_read_write_roundtrip_through_memory() {
        let mut cpu = Cpu::new();
        let mut mem = Memory::new(64);
        let op = Operand::Mem { seg: crate::cpu::segments::SegmentId::Ds, offset: 8, width: crate::cpu::flags::Width::Dword };
        op.write(&mut cpu, &mut mem, 0xCAFEBABE).unwrap();
        assert_eq!(op.read(&cpu, &mem).unwrap(), 0xCAFEBABE);
    }
}
