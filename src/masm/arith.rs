//! Integer arithmetic helpers, Smi tagging and overflow detection.

use super::MacroAssembler;
use crate::asm::reg::{R0, R1};
use crate::asm::{AluOp, Cond, Inst, Label, MemType, OpSize, Operand, Register, UnaryOp, WordWidth};
use crate::error::EmitError;
use crate::layout::SMI_TAG_MASK;

/// Magic multiplier and shift for signed division by a constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MagicNumbers {
    pub multiplier: u32,
    pub shift: u32,
}

/// Compute the multiplier and shift replacing signed division by `divisor`
/// with a multiply-high (Hacker's Delight, 10-1).
pub fn signed_division_by_constant(divisor: u32) -> MagicNumbers {
    const BITS: u32 = 32;
    let min: u32 = 1 << (BITS - 1);
    let neg = (min & divisor) != 0;
    let ad = if neg { 0u32.wrapping_sub(divisor) } else { divisor };
    let t = min.wrapping_add(divisor >> (BITS - 1));
    let anc = t - 1 - t % ad;
    let mut p = BITS - 1;
    let mut q1 = min / anc;
    let mut r1 = min - q1 * anc;
    let mut q2 = min / ad;
    let mut r2 = min - q2 * ad;
    loop {
        p += 1;
        q1 = q1.wrapping_mul(2);
        r1 = r1.wrapping_mul(2);
        if r1 >= anc {
            q1 = q1.wrapping_add(1);
            r1 = r1.wrapping_sub(anc);
        }
        q2 = q2.wrapping_mul(2);
        r2 = r2.wrapping_mul(2);
        if r2 >= ad {
            q2 = q2.wrapping_add(1);
            r2 = r2.wrapping_sub(ad);
        }
        let delta = ad.wrapping_sub(r2);
        if !(q1 < delta || (q1 == delta && r1 == 0)) {
            break;
        }
    }
    let mul = q2.wrapping_add(1);
    MagicNumbers {
        multiplier: if neg { 0u32.wrapping_sub(mul) } else { mul },
        shift: p - BITS,
    }
}

impl MacroAssembler {
    // ==================== Primitive operations ====================

    pub fn alu(&mut self, op: AluOp, size: OpSize, dst: Register, lhs: Register, rhs: impl Into<Operand>) {
        self.emit(Inst::Alu { op, size, dst, lhs, rhs: rhs.into() });
    }

    pub fn add_p(&mut self, dst: Register, lhs: Register, rhs: impl Into<Operand>) {
        let op = self.op();
        self.alu(AluOp::Add, op, dst, lhs, rhs);
    }

    pub fn sub_p(&mut self, dst: Register, lhs: Register, rhs: impl Into<Operand>) {
        let op = self.op();
        self.alu(AluOp::Sub, op, dst, lhs, rhs);
    }

    pub fn and_p(&mut self, dst: Register, lhs: Register, rhs: impl Into<Operand>) {
        let op = self.op();
        self.alu(AluOp::And, op, dst, lhs, rhs);
    }

    pub fn or_p(&mut self, dst: Register, lhs: Register, rhs: impl Into<Operand>) {
        let op = self.op();
        self.alu(AluOp::Or, op, dst, lhs, rhs);
    }

    pub fn xor_p(&mut self, dst: Register, lhs: Register, rhs: impl Into<Operand>) {
        let op = self.op();
        self.alu(AluOp::Xor, op, dst, lhs, rhs);
    }

    pub fn mul_p(&mut self, dst: Register, lhs: Register, rhs: impl Into<Operand>) {
        let op = self.op();
        self.alu(AluOp::Mul, op, dst, lhs, rhs);
    }

    pub fn shift_left_p(&mut self, dst: Register, src: Register, amount: impl Into<Operand>) {
        let op = self.op();
        self.alu(AluOp::Shl, op, dst, src, amount);
    }

    pub fn shift_right_p(&mut self, dst: Register, src: Register, amount: impl Into<Operand>) {
        let op = self.op();
        self.alu(AluOp::Shr, op, dst, src, amount);
    }

    pub fn shift_right_arith_p(&mut self, dst: Register, src: Register, amount: impl Into<Operand>) {
        let op = self.op();
        self.alu(AluOp::Sar, op, dst, src, amount);
    }

    pub fn add_32(&mut self, dst: Register, lhs: Register, rhs: impl Into<Operand>) {
        self.alu(AluOp::Add, OpSize::S32, dst, lhs, rhs);
    }

    pub fn sub_32(&mut self, dst: Register, lhs: Register, rhs: impl Into<Operand>) {
        self.alu(AluOp::Sub, OpSize::S32, dst, lhs, rhs);
    }

    pub fn and_32(&mut self, dst: Register, lhs: Register, rhs: impl Into<Operand>) {
        self.alu(AluOp::And, OpSize::S32, dst, lhs, rhs);
    }

    pub fn shift_left_32(&mut self, dst: Register, src: Register, amount: impl Into<Operand>) {
        self.alu(AluOp::Shl, OpSize::S32, dst, src, amount);
    }

    pub fn shift_right_arith_32(&mut self, dst: Register, src: Register, amount: impl Into<Operand>) {
        self.alu(AluOp::Sar, OpSize::S32, dst, src, amount);
    }

    pub fn neg_p(&mut self, dst: Register, src: Register) {
        let size = self.op();
        self.emit(Inst::Unary { op: UnaryOp::Neg, size, dst, src });
    }

    pub fn cmp_p(&mut self, lhs: Register, rhs: impl Into<Operand>) {
        let size = self.op();
        self.emit(Inst::Cmp { size, lhs, rhs: rhs.into() });
    }

    pub fn cmp_32(&mut self, lhs: Register, rhs: impl Into<Operand>) {
        self.emit(Inst::Cmp { size: OpSize::S32, lhs, rhs: rhs.into() });
    }

    pub fn test_p(&mut self, lhs: Register, rhs: impl Into<Operand>) {
        let size = self.op();
        self.emit(Inst::Test { size, lhs, rhs: rhs.into() });
    }

    /// dst = src, setting the condition codes from the value.
    pub fn load_and_test_p(&mut self, dst: Register, src: Register) {
        self.mov(dst, src);
        self.cmp_p(dst, 0i64);
    }

    /// Decrement `count` and branch to `target` while it is non-zero.
    pub fn branch_on_count(&mut self, count: Register, target: Label) {
        self.alu(AluOp::Sub, OpSize::S64, count, count, 1i64);
        self.branch(Cond::Ne, target);
    }

    // ==================== Bit fields ====================

    /// Clear the low `bits` bits of `src` into `dst`.
    pub fn clear_right_imm(&mut self, dst: Register, src: Register, bits: u32) {
        self.and_p(dst, src, !((1i64 << bits) - 1));
    }

    /// dst = bits hi..=lo of src, shifted down to bit 0.
    pub fn extract_bit_range(&mut self, dst: Register, src: Register, hi: u32, lo: u32) {
        debug_assert!(hi >= lo && hi < 64);
        let width = hi - lo + 1;
        if lo > 0 {
            self.alu(AluOp::Shr, OpSize::S64, dst, src, lo as i64);
        } else {
            self.mov(dst, src);
        }
        if width < 64 {
            self.alu(AluOp::And, OpSize::S64, dst, dst, (1i64 << width) - 1);
        }
    }

    pub fn extract_bit(&mut self, dst: Register, src: Register, bit: u32) {
        self.extract_bit_range(dst, src, bit, bit);
    }

    /// dst = (src & mask) >> trailing zeros of mask. The mask must be a
    /// contiguous run of ones.
    pub fn extract_bit_mask(&mut self, dst: Register, src: Register, mask: i64) {
        let lo = mask.trailing_zeros();
        let hi = 63 - mask.leading_zeros();
        self.extract_bit_range(dst, src, hi, lo);
    }

    /// Jump unless `reg` is a power of two; zero and negative values jump too.
    /// Clobbers r0.
    pub fn jump_if_not_power_of_two_or_zero(&mut self, reg: Register, scratch: Register, not_power_of_two_or_zero: Label) {
        self.sub_p(scratch, reg, 1i64);
        self.cmp_p(scratch, 0i64);
        self.branch(Cond::Lt, not_power_of_two_or_zero);
        self.and_p(R0, reg, scratch);
        self.branch(Cond::Ne, not_power_of_two_or_zero);
    }

    // ==================== Smis ====================

    pub fn smi_tag(&mut self, dst: Register, src: Register) {
        let shift = self.width().smi_shift() as i64;
        self.shift_left_p(dst, src, shift);
    }

    pub fn smi_untag(&mut self, dst: Register, src: Register) {
        let shift = self.width().smi_shift() as i64;
        self.shift_right_arith_p(dst, src, shift);
    }

    /// Condition codes: eq iff `value` is a Smi.
    pub fn test_if_smi(&mut self, value: Register) {
        self.test_p(value, SMI_TAG_MASK);
    }

    /// Condition codes: eq iff `value` is a non-negative Smi.
    pub fn test_if_positive_smi(&mut self, value: Register, scratch: Register) {
        let sign_bit = match self.width() {
            WordWidth::W32 => 1i64 << 31,
            WordWidth::W64 => i64::MIN,
        };
        self.load_imm(scratch, sign_bit | SMI_TAG_MASK);
        self.test_p(value, scratch);
    }

    /// Condition codes: eq iff the 64-bit `value` fits in an int32.
    pub fn test_if_int32(&mut self, value: Register, scratch: Register) {
        self.emit(Inst::Extend { dst: scratch, src: value, ty: MemType::I32 });
        self.emit(Inst::Cmp { size: OpSize::S64, lhs: scratch, rhs: Operand::Reg(value) });
    }

    /// Tag a Smi and leave a negative value in `overflow` when the value did
    /// not fit. Only meaningful where Smis carry 31 bits.
    pub fn smi_tag_check_overflow(&mut self, dst: Register, src: Register, overflow: Register) -> Result<(), EmitError> {
        if self.width().is_64bit() {
            return Err(EmitError::Unsupported("smi_tag_check_overflow on a 64-bit target"));
        }
        if dst == src {
            self.check_not_aliased("smi_tag_check_overflow", &[dst, overflow])?;
            self.mov(overflow, dst);
            self.smi_tag(dst, dst);
            self.xor_p(overflow, overflow, dst);
        } else {
            self.check_not_aliased("smi_tag_check_overflow", &[dst, src, overflow])?;
            self.smi_tag(dst, src);
            self.xor_p(overflow, dst, src);
        }
        self.load_and_test_p(overflow, overflow);
        Ok(())
    }

    /// Byte offset into a pointer array for the Smi index in `src`.
    pub fn smi_to_ptr_array_offset(&mut self, dst: Register, src: Register) {
        let shift = self.width().smi_shift() as i64;
        let log2 = self.width().pointer_size_log2() as i64;
        if shift > log2 {
            self.shift_right_arith_p(dst, src, shift - log2);
        } else {
            self.shift_left_p(dst, src, log2 - shift);
        }
    }

    /// Byte offset into a two-byte array for the Smi index in `src`.
    pub fn smi_to_short_array_offset(&mut self, dst: Register, src: Register) {
        let shift = self.width().smi_shift() as i64;
        if shift > 1 {
            self.shift_right_arith_p(dst, src, shift - 1);
        } else {
            self.mov(dst, src);
        }
    }

    // ==================== Overflow checks ====================

    /// dst = left + right; `overflow_dst` is negative (condition lt) iff the
    /// addition overflowed. Clobbers `scratch`.
    pub fn add_and_check_for_overflow(
        &mut self,
        dst: Register,
        left: Register,
        right: Register,
        overflow_dst: Register,
        scratch: Register,
    ) -> Result<(), EmitError> {
        self.check_not_aliased("add_and_check_for_overflow", &[dst, overflow_dst, scratch])?;
        self.check_not_aliased("add_and_check_for_overflow", &[overflow_dst, left])?;
        self.check_not_aliased("add_and_check_for_overflow", &[overflow_dst, right])?;
        let left_is_right = left == right;

        // C = A + B overflows if A and B have the same sign and C's differs.
        if dst == left {
            self.mov(scratch, left);
            self.add_p(dst, left, right);
            self.xor_p(overflow_dst, scratch, dst);
            if !left_is_right {
                self.xor_p(scratch, dst, right);
            }
        } else if dst == right {
            self.mov(scratch, right);
            self.add_p(dst, left, right);
            self.xor_p(overflow_dst, dst, left);
            if !left_is_right {
                self.xor_p(scratch, dst, scratch);
            }
        } else {
            self.add_p(dst, left, right);
            self.xor_p(overflow_dst, dst, left);
            if !left_is_right {
                self.xor_p(scratch, dst, right);
            }
        }
        if !left_is_right {
            self.and_p(overflow_dst, scratch, overflow_dst);
        }
        self.load_and_test_p(overflow_dst, overflow_dst);
        Ok(())
    }

    /// Immediate form; the constant goes through r1.
    pub fn add_and_check_for_overflow_imm(
        &mut self,
        dst: Register,
        left: Register,
        right: i64,
        overflow_dst: Register,
        scratch: Register,
    ) -> Result<(), EmitError> {
        self.check_not_aliased("add_and_check_for_overflow", &[dst, overflow_dst, scratch, R1])?;
        self.check_not_aliased("add_and_check_for_overflow", &[overflow_dst, left])?;
        self.load_imm(R1, right);
        self.add_and_check_for_overflow(dst, left, R1, overflow_dst, scratch)
    }

    /// dst = left - right; `overflow_dst` is negative (condition lt) iff the
    /// subtraction overflowed. Clobbers `scratch`.
    pub fn sub_and_check_for_overflow(
        &mut self,
        dst: Register,
        left: Register,
        right: Register,
        overflow_dst: Register,
        scratch: Register,
    ) -> Result<(), EmitError> {
        self.check_not_aliased("sub_and_check_for_overflow", &[dst, overflow_dst, scratch])?;
        self.check_not_aliased("sub_and_check_for_overflow", &[overflow_dst, left])?;
        self.check_not_aliased("sub_and_check_for_overflow", &[overflow_dst, right])?;

        // C = A - B overflows if A and B have different signs and C's sign
        // differs from A's.
        if dst == left {
            self.mov(scratch, left);
            self.sub_p(dst, left, right);
            self.xor_p(overflow_dst, dst, scratch);
            self.xor_p(scratch, scratch, right);
        } else if dst == right {
            self.mov(scratch, right);
            self.sub_p(dst, left, right);
            self.xor_p(overflow_dst, dst, left);
            self.xor_p(scratch, scratch, left);
        } else {
            self.sub_p(dst, left, right);
            self.xor_p(overflow_dst, dst, left);
            self.xor_p(scratch, left, right);
        }
        self.and_p(overflow_dst, overflow_dst, scratch);
        self.load_and_test_p(overflow_dst, overflow_dst);
        Ok(())
    }

    pub fn sub_and_check_for_overflow_imm(
        &mut self,
        dst: Register,
        left: Register,
        right: i64,
        overflow_dst: Register,
        scratch: Register,
    ) -> Result<(), EmitError> {
        self.add_and_check_for_overflow_imm(dst, left, right.wrapping_neg(), overflow_dst, scratch)
    }

    // ==================== Division ====================

    /// result = dividend / divisor for int32 values, rounding toward zero,
    /// without a divide instruction. Clobbers r0.
    pub fn truncating_div(&mut self, result: Register, dividend: Register, divisor: i32) -> Result<(), EmitError> {
        if matches!(divisor, -1..=1) {
            return Err(EmitError::Unsupported("truncating_div by -1, 0 or 1"));
        }
        self.check_not_aliased("truncating_div", &[result, dividend, R0])?;
        let mag = signed_division_by_constant(divisor as u32);
        let multiplier = mag.multiplier as i32 as i64;

        self.emit(Inst::Extend { dst: result, src: dividend, ty: MemType::I32 });
        self.alu(AluOp::Mul, OpSize::S64, result, result, multiplier);
        self.alu(AluOp::Sar, OpSize::S64, result, result, 32i64);

        let neg = (mag.multiplier & (1 << 31)) != 0;
        if divisor > 0 && neg {
            self.add_32(result, result, dividend);
        }
        if divisor < 0 && !neg && mag.multiplier > 0 {
            self.sub_32(result, result, dividend);
        }
        if mag.shift > 0 {
            self.shift_right_arith_32(result, result, mag.shift as i64);
        }
        self.extract_bit(R0, dividend, 31);
        self.add_32(result, result, R0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::reg::{R2, R3, R4, R5};
    use crate::config::EmitterConfig;

    #[test]
    fn test_magic_numbers() {
        // Values from Hacker's Delight, table 10-1.
        assert_eq!(signed_division_by_constant(3), MagicNumbers { multiplier: 0x5555_5556, shift: 0 });
        assert_eq!(signed_division_by_constant(5), MagicNumbers { multiplier: 0x6666_6667, shift: 1 });
        assert_eq!(signed_division_by_constant(7), MagicNumbers { multiplier: 0x9249_2493, shift: 2 });
        assert_eq!(
            signed_division_by_constant(-5i32 as u32),
            MagicNumbers { multiplier: 0x9999_9999, shift: 1 }
        );
    }

    #[test]
    fn test_overflow_check_rejects_aliasing() {
        let mut m = MacroAssembler::new(EmitterConfig::default());
        assert!(m.add_and_check_for_overflow(R2, R3, R4, R2, R5).is_err());
        assert!(m.add_and_check_for_overflow(R2, R3, R4, R3, R5).is_err());
        assert!(m.sub_and_check_for_overflow(R2, R3, R4, R5, R5).is_err());
        assert!(m.add_and_check_for_overflow(R2, R3, R4, R5, R1).is_ok());
    }

    #[test]
    fn test_smi_tag_check_overflow_only_on_w32() {
        let mut m = MacroAssembler::new(EmitterConfig::default());
        assert!(m.smi_tag_check_overflow(R2, R3, R4).is_err());
        let mut m = MacroAssembler::new(EmitterConfig::default().with_width(WordWidth::W32));
        assert!(m.smi_tag_check_overflow(R2, R3, R4).is_ok());
    }

    #[test]
    fn test_truncating_div_rejects_trivial_divisors() {
        let mut m = MacroAssembler::new(EmitterConfig::default());
        assert!(m.truncating_div(R2, R3, 1).is_err());
        assert!(m.truncating_div(R2, R3, 0).is_err());
        assert!(m.truncating_div(R2, R2, 3).is_err());
    }

    #[test]
    fn test_clear_right_imm() {
        let mut m = MacroAssembler::new(EmitterConfig::default());
        m.clear_right_imm(R2, R3, 19);
        assert_eq!(
            m.insts(),
            &[Inst::Alu { op: AluOp::And, size: OpSize::S64, dst: R2, lhs: R3, rhs: Operand::Imm(!0x7FFFF) }]
        );
    }
}
