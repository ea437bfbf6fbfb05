//! Instruction operands.

use std::fmt;

use super::reg::{NO_REG, Register};

/// Signed 20-bit displacement range of base+index+displacement addressing.
pub fn is_int20(value: i64) -> bool {
    (-(1 << 19)..(1 << 19)).contains(&value)
}

pub fn is_int16(value: i64) -> bool {
    (i16::MIN as i64..=i16::MAX as i64).contains(&value)
}

pub fn is_int8(value: i64) -> bool {
    (i8::MIN as i64..=i8::MAX as i64).contains(&value)
}

/// Second source operand of an integer operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(Register),
    Imm(i64),
}

impl From<Register> for Operand {
    fn from(reg: Register) -> Self {
        Operand::Reg(reg)
    }
}

impl From<i64> for Operand {
    fn from(imm: i64) -> Self {
        Operand::Imm(imm)
    }
}

impl From<i32> for Operand {
    fn from(imm: i32) -> Self {
        Operand::Imm(imm as i64)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(r) => write!(f, "{}", r),
            Operand::Imm(v) => write!(f, "#{}", v),
        }
    }
}

/// A memory location: `base + index + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemOperand {
    base: Register,
    index: Register,
    offset: i32,
}

impl MemOperand {
    pub fn new(base: Register, offset: i32) -> Self {
        Self { base, index: NO_REG, offset }
    }

    pub fn indexed(base: Register, index: Register, offset: i32) -> Self {
        Self { base, index, offset }
    }

    pub fn base(&self) -> Register {
        self.base
    }

    /// Index register, `NO_REG` when absent.
    pub fn index(&self) -> Register {
        self.index
    }

    pub fn offset(&self) -> i32 {
        self.offset
    }

    /// Whether the displacement fits the addressing mode without help.
    pub fn is_encodable(&self) -> bool {
        is_int20(self.offset as i64)
    }

    pub fn with_offset(self, offset: i32) -> Self {
        Self { offset, ..self }
    }

    pub fn uses(&self, reg: Register) -> bool {
        self.base == reg || (self.index.is_valid() && self.index == reg)
    }
}

impl fmt::Display for MemOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}", self.base)?;
        if self.index.is_valid() {
            write!(f, " + {}", self.index)?;
        }
        if self.offset != 0 {
            write!(f, " {} {}", if self.offset < 0 { "-" } else { "+" }, self.offset.unsigned_abs())?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::reg::{R2, R3};

    #[test]
    fn test_displacement_ranges() {
        assert!(is_int20(524_287));
        assert!(!is_int20(524_288));
        assert!(is_int20(-524_288));
        assert!(is_int16(-32768));
        assert!(!is_int16(32768));
    }

    #[test]
    fn test_mem_operand_display() {
        assert_eq!(MemOperand::new(R2, 8).to_string(), "[r2 + 8]");
        assert_eq!(MemOperand::new(R2, -8).to_string(), "[r2 - 8]");
        assert_eq!(MemOperand::indexed(R2, R3, 0).to_string(), "[r2 + r3]");
    }

    #[test]
    fn test_encodable() {
        assert!(MemOperand::new(R2, 4096).is_encodable());
        assert!(!MemOperand::new(R2, 1 << 20).is_encodable());
        assert!(MemOperand::indexed(R2, R3, 0).uses(R3));
    }
}
