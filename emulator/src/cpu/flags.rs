//! EFLAGS and the shared flag-computation helpers.
//!
//! The bit layout generalizes a 6502 core's status-register bitmask
//! (`FLAG_C`/`FLAG_Z`/`FLAG_N`/... in `nes::cpu`) from an 8-bit register to
//! the 32-bit x86 EFLAGS, and centralizes the per-width arithmetic/logic/
//! shift flag math that `nes::cpu` open-codes per instruction (`adc`,
//! `cmp_reg`, `asl_val`, ...) into one parameterized set of helpers so it
//! isn't repeated at every instruction site.

use bitflags::bitflags;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EFlags: u32 {
        const CF = 1 << 0;
        /// Bit 1 is always 1 on real hardware; kept set by `new`/`reset`.
        const RESERVED1 = 1 << 1;
        const PF = 1 << 2;
        const AF = 1 << 4;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        const TF = 1 << 8;
        const IF = 1 << 9;
        const DF = 1 << 10;
        const OF = 1 << 11;
    }
}

impl Default for EFlags {
    fn default() -> Self {
        EFlags::RESERVED1
    }
}

impl EFlags {
    pub fn set_cond(&mut self, flag: EFlags, on: bool) {
        self.set(flag, on);
    }

    pub fn test(&self, flag: EFlags) -> bool {
        self.contains(flag)
    }
}

/// Operand width in bits, threaded through every flag helper below so the
/// sign/carry/overflow math is computed once instead of per instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Width {
    Byte,
    Word,
    Dword,
}

impl Width {
    pub fn bits(self) -> u32 {
        match self {
            Width::Byte => 8,
            Width::Word => 16,
            Width::Dword => 32,
        }
    }

    pub fn mask(self) -> u32 {
        match self {
            Width::Byte => 0xFF,
            Width::Word => 0xFFFF,
            Width::Dword => 0xFFFF_FFFF,
        }
    }

    pub fn sign_bit(self) -> u32 {
        1 << (self.bits() - 1)
    }
}

/// Parity lookup over the low byte.
const PARITY_TABLE: [bool; 256] = {
    let mut table = [false; 256];
    let mut i = 0usize;
    while i < 256 {
        table[i] = (i as u8).count_ones() % 2 == 0;
        i += 1
    }
    table
};

fn parity_even(result: u32) -> bool {
    PARITY_TABLE[(result & 0xFF) as usize]
}

fn set_zsp(flags: &mut EFlags, result: u32, width: Width) {
    let masked = result & width.mask();
    flags.set_cond(EFlags::ZF, masked == 0);
    flags.set_cond(EFlags::SF, masked & width.sign_bit() != 0);
    flags.set_cond(EFlags::PF, parity_even(masked));
}

/// ADD-family flags (ADD, ADC, INC use the same CF/OF math when carry-in
/// is folded into `rhs` by the caller for ADC).
pub fn add_flags(flags: &mut EFlags, lhs: u32, rhs: u32, result: u64, width: Width) {
    set_zsp(flags, result as u32, width);
    flags.set_cond(EFlags::CF, result > width.mask() as u64);
    let lhs_sign = lhs & width.sign_bit() != 0;
    let rhs_sign = rhs & width.sign_bit() != 0;
    let res_sign = (result as u32) & width.sign_bit() != 0;
    flags.set_cond(EFlags::OF, lhs_sign == rhs_sign && res_sign != lhs_sign);
    flags.set_cond(EFlags::AF, (lhs ^ rhs ^ result as u32) & 0x10 != 0);
}

/// SUB-family flags (SUB, SBB, CMP, DEC use the same CF/OF math).
pub fn sub_flags(flags: &mut EFlags, lhs: u32, rhs: u32, result: i64, width: Width) {
    set_zsp(flags, result as u32, width);
    flags.set_cond(EFlags::CF, result < 0);
    let lhs_sign = lhs & width.sign_bit() != 0;
    let rhs_sign = rhs & width.sign_bit() != 0;
    let res_sign = (result as u32) & width.sign_bit() != 0;
    flags.set_cond(EFlags::OF, lhs_sign != rhs_sign && res_sign != lhs_sign);
    flags.set_cond(EFlags::AF, (lhs ^ rhs ^ result as u32) & 0x10 != 0);
}

/// INC/DEC update every flag SUB/ADD would except CF, per spec.
pub fn incdec_flags(flags: &mut EFlags, lhs: u32, rhs: u32, result: u32, width: Width, is_inc: bool) {
    set_zsp(flags, result, width);
    let lhs_sign = lhs & width.sign_bit() != 0;
    let rhs_sign = rhs & width.sign_bit() != 0;
    let res_sign = result & width.sign_bit() != 0;
    if is_inc {
        flags.set_cond(EFlags::OF, lhs_sign == rhs_sign && res_sign != lhs_sign);
    } else {
        flags.set_cond(EFlags::OF, lhs_sign != rhs_sign && res_sign != lhs_sign);
    }
    flags.set_cond(EFlags::AF, (lhs ^ rhs ^ result) & 0x10 != 0);
}

/// AND/OR/XOR/TEST flags: CF and OF are always cleared, AF undefined (we
/// clear it), ZF/SF/PF from the result.
pub fn logic_flags(flags: &mut EFlags, result: u32, width: Width) {
    set_zsp(flags, result, width);
    flags.set_cond(EFlags::CF, false);
    flags.set_cond(EFlags::OF, false);
    flags.set_cond(EFlags::AF, false);
}

/// Shift/rotate flags. `count` is the masked (mod 32) shift amount,
/// `last_out` is the last bit shifted out of the value (becomes CF),
/// `of_defined` is true only when `count == 1` per spec.
pub fn shift_flags(
    flags: &mut EFlags,
    result: u32,
    width: Width,
    count: u8,
    last_out: Option<bool>,
    of_on_single: Option<bool>,
) {
    if count == 0 {
        return;
    }
    if let Some(bit) = last_out {
        flags.set_cond(EFlags::CF, bit);
    }
    set_zsp(flags, result, width);
    if count == 1 {
        if let Some(of) = of_on_single {
            flags.set_cond(EFlags::OF, of);
        }
    }
}

/// ROL/ROR/RCL/RCR touch only CF (and OF, count==1 only) — unlike
/// SHL/SHR/SAR they leave ZF/SF/PF/AF untouched.
pub fn rotate_flags(flags: &mut EFlags, count: u8, last_out: Option<bool>, of_on_single: Option<bool>) {
    if count == 0 {
        return;
    }
    if let Some(bit) = last_out {
        flags.set_cond(EFlags::CF, bit);
    }
    if count == 1 {
        if let Some(of) = of_on_single {
            flags.set_cond(EFlags::OF, of);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inc_eax_to_zero_sets_zf_and_clears_of_but_not_cf() {
        let mut flags = EFlags::CF; // CF set beforehand, must survive INC
        incdec_flags(&mut flags, 0xFFFF_FFFF, 1, 0, Width::Dword, true);
        assert!(flags.test(EFlags::ZF));
        assert!(flags.test(EFlags::CF), "INC must not touch CF");
        assert!(!flags.test(EFlags::OF));
    }

    #[test]
    fn add_flags_detect_signed_overflow() {
        let mut flags = EFlags::default();
        // 0x7FFFFFFF + 1 overflows into negative: signed overflow.
        add_flags(&mut flags, 0x7FFF_FFFF, 1, 0x8000_0000u64, Width::Dword);
        assert!(flags.test(EFlags::OF));
        assert!(flags.test(EFlags::SF));
        assert!(!flags.test(EFlags::CF));
    }

    #[test]
    fn parity_table_matches_popcount() {
        assert!(parity_even(0b0000_0011)); // two bits set -> even parity
        assert!(!parity_even(0b0000_0001)); // one bit set -> odd parity
    }
}
