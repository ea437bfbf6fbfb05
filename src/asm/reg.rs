//! Register names, register lists and the register conventions.

use std::fmt;

/// A general purpose register.
///
/// A register is only an identity; two handles name the same register iff
/// their codes match. `NO_REG` marks an absent operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Register(u8);

impl Register {
    pub const NUM_REGISTERS: usize = 16;

    pub const fn from_code(code: u8) -> Self {
        Register(code)
    }

    pub fn code(self) -> u8 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        (self.0 as usize) < Self::NUM_REGISTERS
    }

    /// Bit of this register in a `RegList`.
    pub fn bit(self) -> u32 {
        if self.is_valid() { 1 << self.0 } else { 0 }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            11 => write!(f, "fp"),
            12 => write!(f, "ip"),
            13 => write!(f, "cp"),
            15 => write!(f, "sp"),
            n if self.is_valid() => write!(f, "r{}", n),
            _ => write!(f, "no_reg"),
        }
    }
}

pub const R0: Register = Register(0);
pub const R1: Register = Register(1);
pub const R2: Register = Register(2);
pub const R3: Register = Register(3);
pub const R4: Register = Register(4);
pub const R5: Register = Register(5);
pub const R6: Register = Register(6);
pub const R7: Register = Register(7);
pub const R8: Register = Register(8);
pub const R9: Register = Register(9);
pub const R10: Register = Register(10);
pub const R11: Register = Register(11);
pub const R12: Register = Register(12);
pub const R13: Register = Register(13);
pub const R14: Register = Register(14);
pub const R15: Register = Register(15);
pub const NO_REG: Register = Register(0xFF);

/// A floating point register holding a double (or a widened float).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DoubleRegister(u8);

impl DoubleRegister {
    pub const NUM_REGISTERS: usize = 16;

    pub const fn from_code(code: u8) -> Self {
        DoubleRegister(code)
    }

    pub fn code(self) -> u8 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        (self.0 as usize) < Self::NUM_REGISTERS
    }

    pub fn bit(self) -> u32 {
        if self.is_valid() { 1 << self.0 } else { 0 }
    }
}

impl fmt::Display for DoubleRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "d{}", self.0)
        } else {
            write!(f, "no_dreg")
        }
    }
}

pub const D0: DoubleRegister = DoubleRegister(0);
pub const D1: DoubleRegister = DoubleRegister(1);
pub const D2: DoubleRegister = DoubleRegister(2);
pub const D3: DoubleRegister = DoubleRegister(3);
pub const D4: DoubleRegister = DoubleRegister(4);
pub const D5: DoubleRegister = DoubleRegister(5);
pub const D6: DoubleRegister = DoubleRegister(6);
pub const D7: DoubleRegister = DoubleRegister(7);
pub const D8: DoubleRegister = DoubleRegister(8);
pub const D13: DoubleRegister = DoubleRegister(13);
pub const D14: DoubleRegister = DoubleRegister(14);
pub const NO_DREG: DoubleRegister = DoubleRegister(0xFF);

/// A set of registers, one bit per register code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RegList(u32);

impl RegList {
    pub const fn empty() -> Self {
        RegList(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        RegList(bits)
    }

    pub fn of(regs: &[Register]) -> Self {
        RegList(regs.iter().fold(0, |acc, r| acc | r.bit()))
    }

    pub fn of_doubles(regs: &[DoubleRegister]) -> Self {
        RegList(regs.iter().fold(0, |acc, r| acc | r.bit()))
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, code: u8) -> bool {
        code < 32 && self.0 & (1 << code) != 0
    }

    pub fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn union(self, other: RegList) -> RegList {
        RegList(self.0 | other.0)
    }

    /// Register codes in ascending order.
    pub fn codes(self) -> impl DoubleEndedIterator<Item = u8> {
        (0u8..32).filter(move |&c| self.contains(c))
    }
}

/// Whether any two valid registers in `regs` are the same register.
/// Invalid entries (`NO_REG`) are ignored.
pub fn are_aliased(regs: &[Register]) -> bool {
    let valid = regs.iter().filter(|r| r.is_valid()).count();
    RegList::of(regs).count() != valid
}

/// Register conventions.
pub mod regs {
    use super::*;

    /// Stack pointer
    pub const SP: Register = R15;
    /// Frame pointer
    pub const FP: Register = R11;
    /// Context pointer
    pub const CP: Register = R13;
    /// Link register (return address written by calls)
    pub const LR: Register = R14;
    /// Intra-sequence scratch register
    pub const IP: Register = R12;
    /// Base of the roots table
    pub const ROOTS: Register = R10;
    /// Return value
    pub const RETURN: Register = R2;

    /// Integer argument registers, in order.
    pub const ARGS: [Register; 5] = [R2, R3, R4, R5, R6];
    pub const NUM_REGISTER_ARGS: usize = 5;

    /// Registers the register allocator may hand out.
    pub const ALLOCATABLE: RegList =
        RegList::from_bits(0b0010_0011_1111_1100); // r2-r9, cp
    /// Size of the spill block the safepoint tables expect.
    pub const NUM_SAFEPOINT_REGISTERS: usize = 16;

    pub const SCRATCH_DOUBLE: DoubleRegister = D13;
    pub const DOUBLE_REG_ZERO: DoubleRegister = D14;
    pub const FLOAT_RESULT: DoubleRegister = D0;
    pub const FLOAT_PARAM: DoubleRegister = D0;
    /// Doubles saved around foreign calls when an exit frame saves doubles.
    pub const CALLER_SAVED_DOUBLES: RegList = RegList::from_bits(0x00FF); // d0-d7
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_validity() {
        assert!(R0.is_valid());
        assert!(R15.is_valid());
        assert!(!NO_REG.is_valid());
        assert_eq!(NO_REG.bit(), 0);
        assert_eq!(format!("{}", regs::SP), "sp");
        assert_eq!(format!("{}", R3), "r3");
    }

    #[test]
    fn test_aliasing() {
        assert!(!are_aliased(&[R2, R3, R4]));
        assert!(are_aliased(&[R2, R3, R2]));
        assert!(!are_aliased(&[R2, NO_REG, NO_REG]));
    }

    #[test]
    fn test_allocatable_set() {
        let codes: Vec<u8> = regs::ALLOCATABLE.codes().collect();
        assert_eq!(codes, vec![2, 3, 4, 5, 6, 7, 8, 9, 13]);
        assert_eq!(regs::CALLER_SAVED_DOUBLES.count(), 8);
    }

    #[test]
    fn test_reglist_order() {
        let list = RegList::of(&[R9, R2, R5]);
        assert_eq!(list.codes().collect::<Vec<_>>(), vec![2, 5, 9]);
        assert_eq!(list.codes().rev().collect::<Vec<_>>(), vec![9, 5, 2]);
    }
}
