//! Pointer width strategy.
//!
//! Every size-dependent choice (pointer size, Smi encoding, which operand
//! size a "pointer" operation uses) is answered by `WordWidth`, chosen once
//! per emission pass.

use serde::{Deserialize, Serialize};

/// Operand size of an integer operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpSize {
    S32,
    S64,
}

impl OpSize {
    pub fn bits(self) -> u32 {
        match self {
            OpSize::S32 => 32,
            OpSize::S64 => 64,
        }
    }

    /// Truncate `value` to this size, zero-extending the result.
    pub fn truncate(self, value: u64) -> u64 {
        match self {
            OpSize::S32 => value & 0xFFFF_FFFF,
            OpSize::S64 => value,
        }
    }

    /// Interpret the low bits of `value` as a signed integer of this size.
    pub fn signed(self, value: u64) -> i64 {
        match self {
            OpSize::S32 => value as u32 as i32 as i64,
            OpSize::S64 => value as i64,
        }
    }
}

/// Target pointer width.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WordWidth {
    W32,
    #[default]
    W64,
}

impl WordWidth {
    pub const DOUBLE_SIZE: i32 = 8;

    pub fn pointer_size(self) -> i32 {
        match self {
            WordWidth::W32 => 4,
            WordWidth::W64 => 8,
        }
    }

    pub fn pointer_size_log2(self) -> u32 {
        match self {
            WordWidth::W32 => 2,
            WordWidth::W64 => 3,
        }
    }

    /// Operand size used by pointer-sized operations.
    pub fn op_size(self) -> OpSize {
        match self {
            WordWidth::W32 => OpSize::S32,
            WordWidth::W64 => OpSize::S64,
        }
    }

    pub fn is_64bit(self) -> bool {
        self == WordWidth::W64
    }

    /// Total shift applied when tagging a Smi (tag size plus shift size).
    pub fn smi_shift(self) -> u32 {
        match self {
            WordWidth::W32 => 1,
            WordWidth::W64 => 32,
        }
    }

    /// Number of payload bits in a Smi.
    pub fn smi_value_bits(self) -> u32 {
        match self {
            WordWidth::W32 => 31,
            WordWidth::W64 => 32,
        }
    }

    pub fn smi_max(self) -> i64 {
        (1i64 << (self.smi_value_bits() - 1)) - 1
    }

    pub fn smi_min(self) -> i64 {
        -(1i64 << (self.smi_value_bits() - 1))
    }

    pub fn is_valid_smi(self, value: i64) -> bool {
        value >= self.smi_min() && value <= self.smi_max()
    }

    /// Tagged representation of a Smi, truncated to the pointer width.
    pub fn smi_bits(self, value: i64) -> u64 {
        self.op_size().truncate((value << self.smi_shift()) as u64)
    }

    /// Decode a tagged Smi.
    pub fn smi_value(self, bits: u64) -> i64 {
        self.op_size().signed(bits) >> self.smi_shift()
    }
}

impl std::fmt::Display for WordWidth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WordWidth::W32 => write!(f, "w32"),
            WordWidth::W64 => write!(f, "w64"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pointer_sizes() {
        assert_eq!(WordWidth::W32.pointer_size(), 4);
        assert_eq!(WordWidth::W64.pointer_size(), 8);
        assert_eq!(1 << WordWidth::W64.pointer_size_log2(), 8);
    }

    #[test]
    fn test_smi_encoding() {
        assert_eq!(WordWidth::W64.smi_bits(3), 3u64 << 32);
        assert_eq!(WordWidth::W32.smi_bits(3), 6);
        assert_eq!(WordWidth::W32.smi_bits(-1), 0xFFFF_FFFE);
        assert_eq!(WordWidth::W32.smi_value(0xFFFF_FFFE), -1);
        assert_eq!(WordWidth::W64.smi_value(WordWidth::W64.smi_bits(-7)), -7);
    }

    #[test]
    fn test_smi_range() {
        assert!(WordWidth::W32.is_valid_smi((1 << 30) - 1));
        assert!(!WordWidth::W32.is_valid_smi(1 << 30));
        assert!(WordWidth::W64.is_valid_smi(i32::MAX as i64));
        assert!(!WordWidth::W64.is_valid_smi(i32::MAX as i64 + 1));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(OpSize::S32.truncate(0x1_0000_0001), 1);
        assert_eq!(OpSize::S32.signed(0xFFFF_FFFF), -1);
        assert_eq!(OpSize::S64.signed(u64::MAX), -1);
    }
}
