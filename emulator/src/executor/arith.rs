//! ALU, INC/DEC/NEG/NOT, MUL/IMUL/DIV/IDIV and the shift/rotate group.
//!
//! Every flag computation is delegated to `cpu::flags`'s width-generic
//! helpers; this module's job is only to compute the raw result and pick
//! the right helper, mirroring how `nes::cpu::adc`/`cmp_reg` compute a
//! result and call `set_zn` rather than poking bits inline.

use crate::cpu::flags::{self, Width};
use crate::cpu::registers::Reg32;
use crate::cpu::Cpu;
use crate::decoder::{AluOp, Operand, ShiftCount, ShiftOp};
use crate::error::{EmuError, Result};
use crate::memory::Memory;

fn sign_extend(value: u32, width: Width) -> i32 {
    let shift = 32 - width.bits();
    ((value << shift) as i32) >> shift
}

pub fn alu(cpu: &mut Cpu, mem: &mut Memory, op: AluOp, dst: &Operand, src: &Operand) -> Result<()> {
    let width = dst.width();
    let lhs = dst.read(cpu, mem)? & width.mask();
    let rhs = src.read(cpu, mem)? & width.mask();
    let carry_in = cpu.flags.test(flags::EFlags::CF) as u32;

    match op {
        AluOp::Add => {
            let result = lhs as u64 + rhs as u64;
            flags::add_flags(&mut cpu.flags, lhs, rhs, result, width);
            dst.write(cpu, mem, result as u32 & width.mask())
        }
        AluOp::Adc => {
            let rhs_eff = rhs.wrapping_add(carry_in) & width.mask();
            let result = lhs as u64 + rhs as u64 + carry_in as u64;
            flags::add_flags(&mut cpu.flags, lhs, rhs_eff, result, width);
            dst.write(cpu, mem, result as u32 & width.mask())
        }
        AluOp::Sub => {
            let result = lhs as i64 - rhs as i64;
            flags::sub_flags(&mut cpu.flags, lhs, rhs, result, width);
            dst.write(cpu, mem, result as u32 & width.mask())
        }
        AluOp::Sbb => {
            let rhs_eff = rhs.wrapping_add(carry_in) & width.mask();
            let result = lhs as i64 - rhs as i64 - carry_in as i64;
            flags::sub_flags(&mut cpu.flags, lhs, rhs_eff, result, width);
            dst.write(cpu, mem, result as u32 & width.mask())
        }
        AluOp::Cmp => {
            let result = lhs as i64 - rhs as i64;
            flags::sub_flags(&mut cpu.flags, lhs, rhs, result, width);
            Ok(())
        }
        AluOp::And => {
            let result = lhs & rhs;
            flags::logic_flags(&mut cpu.flags, result, width);
            dst.write(cpu, mem, result)
        }
        AluOp::Or => {
            let result = lhs | rhs;
            flags::logic_flags(&mut cpu.flags, result, width);
            dst.write(cpu, mem, result)
        }
        AluOp::Xor => {
            let result = lhs ^ rhs;
            flags::logic_flags(&mut cpu.flags, result, width);
            dst.write(cpu, mem, result)
        }
    }
}

pub fn test(cpu: &mut Cpu, mem: &mut Memory, dst: &Operand, src: &Operand) -> Result<()> {
    let width = dst.width();
    let lhs = dst.read(cpu, mem)? & width.mask();
    let rhs = src.read(cpu, mem)? & width.mask();
    flags::logic_flags(&mut cpu.flags, lhs & rhs, width);
    Ok(())
}

pub fn inc(cpu: &mut Cpu, mem: &mut Memory, dst: &Operand) -> Result<()> {
    let width = dst.width();
    let lhs = dst.read(cpu, mem)? & width.mask();
    let result = lhs.wrapping_add(1) & width.mask();
    flags::incdec_flags(&mut cpu.flags, lhs, 1, result, width, true);
    dst.write(cpu, mem, result)
}

pub fn dec(cpu: &mut Cpu, mem: &mut Memory, dst: &Operand) -> Result<()> {
    let width = dst.width();
    let lhs = dst.read(cpu, mem)? & width.mask();
    let result = lhs.wrapping_sub(1) & width.mask();
    flags::incdec_flags(&mut cpu.flags, lhs, 1, result, width, false);
    dst.write(cpu, mem, result)
}

pub fn neg(cpu: &mut Cpu, mem: &mut Memory, dst: &Operand) -> Result<()> {
    let width = dst.width();
    let val = dst.read(cpu, mem)? & width.mask();
    let result = 0i64 - val as i64;
    flags::sub_flags(&mut cpu.flags, 0, val, result, width);
    dst.write(cpu, mem, result as u32 & width.mask())
}

pub fn not(cpu: &mut Cpu, mem: &mut Memory, dst: &Operand) -> Result<()> {
    let width = dst.width();
    let val = dst.read(cpu, mem)? & width.mask();
    dst.write(cpu, mem, !val & width.mask())
}

pub fn mul(cpu: &mut Cpu, mem: &mut Memory, src: &Operand) -> Result<()> {
    let width = src.width();
    let rhs = src.read(cpu, mem)? & width.mask();
    match width {
        Width::Byte => {
            let al = cpu.regs.get8_low(Reg32::Eax) as u32;
            let result = al * rhs;
            cpu.regs.set16(Reg32::Eax, result as u16);
            let overflow = result > 0xFF;
            cpu.flags.set_cond(flags::EFlags::CF, overflow);
            cpu.flags.set_cond(flags::EFlags::OF, overflow);
        }
        Width::Word => {
            let ax = cpu.regs.get16(Reg32::Eax) as u32;
            let result = ax * rhs;
            cpu.regs.set16(Reg32::Eax, result as u16);
            cpu.regs.set16(Reg32::Edx, (result >> 16) as u16);
            let overflow = result > 0xFFFF;
            cpu.flags.set_cond(flags::EFlags::CF, overflow);
            cpu.flags.set_cond(flags::EFlags::OF, overflow);
        }
        Width::Dword => {
            let eax = cpu.get_reg32(Reg32::Eax) as u64;
            let result = eax * rhs as u64;
            cpu.set_reg32(Reg32::Eax, result as u32);
            cpu.set_reg32(Reg32::Edx, (result >> 32) as u32);
            let overflow = result > 0xFFFF_FFFF;
            cpu.flags.set_cond(flags::EFlags::CF, overflow);
            cpu.flags.set_cond(flags::EFlags::OF, overflow);
        }
    }
    Ok(())
}

pub fn imul(cpu: &mut Cpu, mem: &mut Memory, src: &Operand) -> Result<()> {
    let width = src.width();
    let rhs = sign_extend(src.read(cpu, mem)? & width.mask(), width) as i64;
    match width {
        Width::Byte => {
            let al = cpu.regs.get8_low(Reg32::Eax) as i8 as i64;
            let result = al * rhs;
            cpu.regs.set16(Reg32::Eax, result as u16);
            let overflow = result != (result as i8) as i64;
            cpu.flags.set_cond(flags::EFlags::CF, overflow);
            cpu.flags.set_cond(flags::EFlags::OF, overflow);
        }
        Width::Word => {
            let ax = cpu.regs.get16(Reg32::Eax) as i16 as i64;
            let result = ax * rhs;
            cpu.regs.set16(Reg32::Eax, result as u16);
            cpu.regs.set16(Reg32::Edx, (result >> 16) as u16);
            let overflow = result != (result as i16) as i64;
            cpu.flags.set_cond(flags::EFlags::CF, overflow);
            cpu.flags.set_cond(flags::EFlags::OF, overflow);
        }
        Width::Dword => {
            let eax = cpu.get_reg32(Reg32::Eax) as i32 as i64;
            let result = eax * rhs;
            cpu.set_reg32(Reg32::Eax, result as u32);
            cpu.set_reg32(Reg32::Edx, (result >> 32) as u32);
            let overflow = result != (result as i32) as i64;
            cpu.flags.set_cond(flags::EFlags::CF, overflow);
            cpu.flags.set_cond(flags::EFlags::OF, overflow);
        }
    }
    Ok(())
}

pub fn div(cpu: &mut Cpu, mem: &mut Memory, src: &Operand) -> Result<()> {
    let width = src.width();
    let divisor = src.read(cpu, mem)? & width.mask();
    if divisor == 0 {
        return Err(EmuError::DivideByZero);
    }
    match width {
        Width::Byte => {
            let dividend = cpu.regs.get16(Reg32::Eax) as u32;
            let (q, r) = (dividend / divisor, dividend % divisor);
            if q > u8::MAX as u32 {
                return Err(EmuError::DivideByZero);
            }
            cpu.regs.set8_low(Reg32::Eax, q as u8);
            cpu.regs.set8_high(Reg32::Eax, r as u8);
        }
        Width::Word => {
            let dividend = ((cpu.regs.get16(Reg32::Edx) as u32) << 16) | cpu.regs.get16(Reg32::Eax) as u32;
            let (q, r) = (dividend / divisor, dividend % divisor);
            if q > u16::MAX as u32 {
                return Err(EmuError::DivideByZero);
            }
            cpu.regs.set16(Reg32::Eax, q as u16);
            cpu.regs.set16(Reg32::Edx, r as u16);
        }
        Width::Dword => {
            let dividend = ((cpu.get_reg32(Reg32::Edx) as u64) << 32) | cpu.get_reg32(Reg32::Eax) as u64;
            let (q, r) = (dividend / divisor as u64, dividend % divisor as u64);
            if q > u32::MAX as u64 {
                return Err(EmuError::DivideByZero);
            }
            cpu.set_reg32(Reg32::Eax, q as u32);
            cpu.set_reg32(Reg32::Edx, r as u32);
        }
    }
    Ok(())
}

pub fn idiv(cpu: &mut Cpu, mem: &mut Memory, src: &Operand) -> Result<()> {
    let width = src.width();
    let divisor = sign_extend(src.read(cpu, mem)? & width.mask(), width) as i64;
    if divisor == 0 {
        return Err(EmuError::DivideByZero);
    }
    match width {
        Width::Byte => {
            let dividend = cpu.regs.get16(Reg32::Eax) as i16 as i64;
            let (q, r) = (dividend / divisor, dividend % divisor);
            if q > i8::MAX as i64 || q < i8::MIN as i64 {
                return Err(EmuError::DivideByZero);
            }
            cpu.regs.set8_low(Reg32::Eax, q as u8);
            cpu.regs.set8_high(Reg32::Eax, r as u8);
        }
        Width::Word => {
            let dividend = (((cpu.regs.get16(Reg32::Edx) as u32) << 16) | cpu.regs.get16(Reg32::Eax) as u32) as i32 as i64;
            let (q, r) = (dividend / divisor, dividend % divisor);
            if q > i16::MAX as i64 || q < i16::MIN as i64 {
                return Err(EmuError::DivideByZero);
            }
            cpu.regs.set16(Reg32::Eax, q as u16);
            cpu.regs.set16(Reg32::Edx, r as u16);
        }
        Width::Dword => {
            let dividend = (((cpu.get_reg32(Reg32::Edx) as u64) << 32) | cpu.get_reg32(Reg32::Eax) as u64) as i64;
            let (q, r) = (dividend / divisor, dividend % divisor);
            if q > i32::MAX as i64 || q < i32::MIN as i64 {
                return Err(EmuError::DivideByZero);
            }
            cpu.set_reg32(Reg32::Eax, q as u32);
            cpu.set_reg32(Reg32::Edx, r as u32);
        }
    }
    Ok(())
}

pub fn shift(cpu: &mut Cpu, mem: &mut Memory, op: ShiftOp, dst: &Operand, count: ShiftCount) -> Result<()> {
    let width = dst.width();
    let raw_count = match count {
        ShiftCount::One => 1u8,
        ShiftCount::Cl => cpu.regs.get8_low(Reg32::Ecx),
        ShiftCount::Imm(v) => v,
    } & 0x1F;

    let val = dst.read(cpu, mem)? & width.mask();
    let bits = width.bits();

    match op {
        ShiftOp::Shl | ShiftOp::Sal => {
            if raw_count == 0 {
                return Ok(());
            }
            let result = if raw_count >= 32 { 0 } else { (val as u64) << raw_count };
            let last_out = if raw_count as u32 <= bits {
                Some((val >> (bits - raw_count as u32)) & 1 != 0)
            } else {
                Some(false)
            };
            let masked = result as u32 & width.mask();
            let of = (masked & width.sign_bit() != 0) != last_out.unwrap_or(false);
            flags::shift_flags(&mut cpu.flags, masked, width, raw_count, last_out, Some(of));
            dst.write(cpu, mem, masked)
        }
        ShiftOp::Shr => {
            if raw_count == 0 {
                return Ok(());
            }
            let result = val >> raw_count.min(31);
            let last_out = Some((val >> (raw_count - 1).min(31)) & 1 != 0);
            let of = val & width.sign_bit() != 0;
            flags::shift_flags(&mut cpu.flags, result, width, raw_count, last_out, Some(of));
            dst.write(cpu, mem, result)
        }
        ShiftOp::Sar => {
            if raw_count == 0 {
                return Ok(());
            }
            let signed = sign_extend(val, width);
            let shifted = signed >> raw_count.min(31);
            let result = shifted as u32 & width.mask();
            let last_out = Some((val >> (raw_count - 1).min(31)) & 1 != 0);
            flags::shift_flags(&mut cpu.flags, result, width, raw_count, last_out, Some(false));
            dst.write(cpu, mem, result)
        }
        ShiftOp::Rol => {
            let n = raw_count % bits as u8;
            let result = if n == 0 { val } else { ((val << n) | (val >> (bits as u8 - n))) & width.mask() };
            let cf = result & 1 != 0;
            let of = (result & width.sign_bit() != 0) != cf;
            flags::rotate_flags(&mut cpu.flags, raw_count, Some(cf), Some(of));
            dst.write(cpu, mem, result)
        }
        ShiftOp::Ror => {
            let n = raw_count % bits as u8;
            let result = if n == 0 { val } else { ((val >> n) | (val << (bits as u8 - n))) & width.mask() };
            let cf = result & width.sign_bit() != 0;
            let second_bit = (result >> (bits - 2)) & 1 != 0;
            let of = cf != second_bit;
            flags::rotate_flags(&mut cpu.flags, raw_count, Some(cf), Some(of));
            dst.write(cpu, mem, result)
        }
        ShiftOp::Rcl => {
            let cf_in = cpu.flags.test(flags::EFlags::CF) as u32;
            let wide = (val as u64) | ((cf_in as u64) << bits);
            let total_bits = bits + 1;
            let n = (raw_count as u32) % total_bits;
            let rotated = if n == 0 {
                wide
            } else {
                ((wide << n) | (wide >> (total_bits - n))) & ((1u64 << total_bits) - 1)
            };
            let result = (rotated & width.mask() as u64) as u32;
            let cf = (rotated >> bits) & 1 != 0;
            let of = (result & width.sign_bit() != 0) != cf;
            flags::rotate_flags(&mut cpu.flags, raw_count, Some(cf), Some(of));
            dst.write(cpu, mem, result)
        }
        ShiftOp::Rcr => {
            let cf_in = cpu.flags.test(flags::EFlags::CF) as u32;
            let wide = (val as u64) | ((cf_in as u64) << bits);
            let total_bits = bits + 1;
            let n = (raw_count as u32) % total_bits;
            let rotated = if n == 0 {
                wide
            } else {
                ((wide >> n) | (wide << (total_bits - n))) & ((1u64 << total_bits) - 1)
            };
            let result = (rotated & width.mask() as u64) as u32;
            let cf = (rotated >> bits) & 1 != 0;
            let of = (val & width.sign_bit() != 0) != cf;
            flags::rotate_flags(&mut cpu.flags, raw_count, Some(cf), Some(of));
            dst.write(cpu, mem, result)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::flags::EFlags;

    #[test]
    fn add_sets_carry_on_unsigned_overflow() {
        let mut cpu = Cpu::new();
        let mut mem = Memory::new(16);
        cpu.set_reg32(Reg32::Eax, 0xFFFF_FFFF);
        let dst = Operand::Reg(Reg32::Eax, Width::Dword);
        alu(&mut cpu, &mut mem, AluOp::Add, &dst, &Operand::Imm(1)).unwrap();
        assert_eq!(cpu.get_reg32(Reg32::Eax), 0);
        assert!(cpu.flags.test(EFlags::CF));
        assert!(cpu.flags.test(EFlags::ZF));
    }

    #[test]
    fn cmp_does_not_modify_destination() {
        let mut cpu = Cpu::new();
        let mut mem = Memory::new(16);
        cpu.set_reg32(Reg32::Eax, 5);
        let dst = Operand::Reg(Reg32::Eax, Width::Dword);
        alu(&mut cpu, &mut mem, AluOp::Cmp, &dst, &Operand::Imm(5)).unwrap();
        assert_eq!(cpu.get_reg32(Reg32::Eax), 5);
        assert!(cpu.flags.test(EFlags::ZF));
    }

    #[test]
    fn div_by_zero_is_an_error() {
        let mut cpu = Cpu::new();
        let mut mem = Memory::new(16);
        cpu.set_reg32(Reg32::Eax, 10);
        let src = Operand::Imm(0);
        assert!(matches!(div(&mut cpu, &mut mem, &src), Err(EmuError::DivideByZero)));
    }

    #[test]
    fn shl_by_one_sets_cf_from_vacated_bit() {
        let mut cpu = Cpu::new();
        let mut mem = Memory::new(16);
        cpu.set_reg32(Reg32::Eax, 0x8000_0000);
        let dst = Operand::Reg(Reg32::Eax, Width::Dword);
        shift(&mut cpu, &mut mem, ShiftOp::Shl, &dst, ShiftCount::One).unwrap();
        assert_eq!(cpu.get_reg32(Reg32::Eax), 0);
        assert!(cpu.flags.test(EFlags::CF));
        assert!(cpu.flags.test(EFlags::ZF));
    }

    #[test]
    fn rol_byte_wraps_high_bit_to_low() {
        let mut cpu = Cpu::new();
        let mut mem = Memory::new(16);
        cpu.regs.set8_low(Reg32::Eax, 0x81);
        let dst = Operand::Reg(Reg32::Eax, Width::Byte);
        shift(&mut cpu, &mut mem, ShiftOp::Rol, &dst, ShiftCount::One).unwrap();
        assert_eq!(cpu.regs.get8_low(Reg32::Eax), 0x03);
        assert!(cpu.flags.test(EFlags::CF));
    }

    #[test]
    fn shift_by_zero_leaves_flags_and_value_untouched() {
        let mut cpu = Cpu::new();
        let mut mem = Memory::new(16);
        cpu.set_reg32(Reg32::Eax, 0x42);
        cpu.flags.set_cond(EFlags::CF, true);
        let dst = Operand::Reg(Reg32::Eax, Width::Dword);
        shift(&mut cpu, &mut mem, ShiftOp::Shl, &dst, ShiftCount::Imm(0)).unwrap();
        assert_eq!(cpu.get_reg32(Reg32::Eax), 0x42);
        assert!(cpu.flags.test(EFlags::CF));
    }
}
