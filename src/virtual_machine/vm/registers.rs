use crate::virtual_machine::isa::{
    REG_BP, REG_R0, REG_R1, REG_R2, REG_R4, REG_R5, REG_SP, REGISTER_COUNT, STACK_TOP,
    register_name,
};
use std::fmt;

/// A register index known to be in range.
///
/// Only [`Reg::new`] builds one from a raw byte, so indexing the register file with a
/// `Reg` cannot go out of bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reg(u8);

impl Reg {
    pub const R0: Reg = Reg(REG_R0);
    pub const R1: Reg = Reg(REG_R1);
    pub const R2: Reg = Reg(REG_R2);
    pub const R4: Reg = Reg(REG_R4);
    pub const R5: Reg = Reg(REG_R5);
    pub const SP: Reg = Reg(REG_SP);
    pub const BP: Reg = Reg(REG_BP);

    pub const fn new(index: u8) -> Option<Reg> {
        if (index as usize) < REGISTER_COUNT {
            Some(Reg(index))
        } else {
            None
        }
    }

    pub const fn index(self) -> u8 {
        self.0
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", register_name(self.0).unwrap_or("?"))
    }
}

/// Condition flags set by `cmp`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Flags {
    pub zero: bool,
    /// Signed less-than.
    pub sign: bool,
    /// Unsigned borrow.
    pub carry: bool,
}

impl Flags {
    /// Flags describing `a - b`.
    pub fn compare(a: u32, b: u32) -> Flags {
        Flags {
            zero: a == b,
            sign: (a as i32) < (b as i32),
            carry: a < b,
        }
    }

    /// Signed greater-than after a compare.
    pub fn greater(self) -> bool {
        !self.zero && !self.sign
    }
}

/// The guest register file: fifteen 32-bit registers, the program counter and flags.
pub struct Registers {
    regs: [u32; REGISTER_COUNT],
    pub pc: u32,
    pub flags: Flags,
}

impl Registers {
    /// All registers zero except `$sp` and `$bp`, which start at the top of the stack.
    pub fn new(entry: u32) -> Self {
        let mut regs = [0; REGISTER_COUNT];
        regs[Reg::SP.0 as usize] = STACK_TOP;
        regs[Reg::BP.0 as usize] = STACK_TOP;
        Self {
            regs,
            pc: entry,
            flags: Flags::default(),
        }
    }

    pub fn get(&self, reg: Reg) -> u32 {
        self.regs[reg.0 as usize]
    }

    pub fn set(&mut self, reg: Reg, value: u32) {
        self.regs[reg.0 as usize] = value;
    }

    /// Replaces the low byte of `reg`, keeping the upper 24 bits.
    pub fn set_low_byte(&mut self, reg: Reg, byte: u8) {
        let slot = &mut self.regs[reg.0 as usize];
        *slot = (*slot & !0xFF) | byte as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reg_rejects_out_of_range() {
        assert!(Reg::new(14).is_some());
        assert!(Reg::new(15).is_none());
        assert!(Reg::new(0xFF).is_none());
        assert_eq!(Reg::SP.to_string(), "$sp");
    }

    #[test]
    fn stack_registers_start_at_top() {
        let regs = Registers::new(0x1000);
        assert_eq!(regs.get(Reg::SP), STACK_TOP);
        assert_eq!(regs.get(Reg::BP), STACK_TOP);
        assert_eq!(regs.get(Reg::R0), 0);
        assert_eq!(regs.pc, 0x1000);
    }

    #[test]
    fn low_byte_write_keeps_upper_bits() {
        let mut regs = Registers::new(0);
        regs.set(Reg::R1, 0x1234_5678);
        regs.set_low_byte(Reg::R1, 0xAB);
        assert_eq!(regs.get(Reg::R1), 0x1234_56AB);
    }

    #[test]
    fn compare_sets_signed_and_unsigned_flags() {
        let f = Flags::compare(5, 5);
        assert!(f.zero && !f.sign && !f.carry);

        let f = Flags::compare(0xFFFF_FFFF, 1);
        assert!(!f.zero);
        assert!(f.sign, "-1 < 1 signed");
        assert!(!f.carry, "0xffffffff > 1 unsigned");
        assert!(!f.greater());

        let f = Flags::compare(7, 3);
        assert!(f.greater());
    }
}
