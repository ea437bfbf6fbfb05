//! Conversions between doubles and integers.
//!
//! Double to integer conversions go through a 64-bit integer register even
//! on 32-bit targets; out of range and NaN inputs produce the most negative
//! 64-bit value, which never passes the int32 range test.

use super::{MacroAssembler, field_mem};
use crate::asm::reg::R0;
use crate::asm::{
    AluOp, Cond, DoubleRegister, FloatKind, Inst, IntKind, Label, MemOperand, OpSize, Operand,
    Register, RoundingMode, Stub, WordWidth, regs,
};
use crate::error::EmitError;
use crate::layout::{DOUBLE_EXPONENT_ALL_ONES, DOUBLE_EXPONENT_MASK, MINUS_ZERO_BITS};

/// Exponent field of a double as seen in the full 64-bit pattern.
const EXPONENT_MASK_64: i64 = DOUBLE_EXPONENT_MASK << 32;

fn check_double_scratch(op: &'static str, input: DoubleRegister, scratch: DoubleRegister) -> Result<(), EmitError> {
    if input == scratch {
        return Err(EmitError::AliasedRegisters(format!("{}({}, {})", op, input, scratch)));
    }
    Ok(())
}

impl MacroAssembler {
    pub fn convert_unsigned_int_to_double(&mut self, src: Register, dst: DoubleRegister) {
        self.emit(Inst::CvtIntToFloat { dst, src, from: IntKind::U32, to: FloatKind::F64 });
    }

    pub fn convert_int_to_float(&mut self, dst: DoubleRegister, src: Register) {
        self.emit(Inst::CvtIntToFloat { dst, src, from: IntKind::I32, to: FloatKind::F32 });
    }

    /// dst = round(input) as a 64-bit integer; `double_dst` receives the
    /// same bits.
    pub fn convert_double_to_int64(
        &mut self,
        input: DoubleRegister,
        dst: Register,
        double_dst: DoubleRegister,
        mode: RoundingMode,
    ) {
        self.emit(Inst::CvtFloatToInt { dst, src: input, to: IntKind::I64, mode });
        self.emit(Inst::MovGprToD { dst: double_dst, src: dst });
    }

    pub fn smi_to_double(&mut self, value: DoubleRegister, smi: Register) {
        self.smi_untag(regs::IP, smi);
        self.convert_int_to_double(regs::IP, value);
    }

    /// Condition codes: eq iff `input` is exactly an int32, which is then
    /// in `result`.
    pub fn try_double_to_int32_exact(
        &mut self,
        result: Register,
        input: DoubleRegister,
        scratch: Register,
        double_scratch: DoubleRegister,
    ) -> Result<(), EmitError> {
        check_double_scratch("try_double_to_int32_exact", input, double_scratch)?;
        let done = self.new_label();
        self.convert_double_to_int64(input, result, double_scratch, RoundingMode::ToZero);
        self.test_if_int32(result, R0);
        self.branch(Cond::Ne, done);

        // Convert back and compare.
        self.emit(Inst::MovDToGpr { dst: scratch, src: double_scratch });
        self.emit(Inst::CvtIntToFloat { dst: double_scratch, src: scratch, from: IntKind::I32, to: FloatKind::F64 });
        self.emit(Inst::FCmp { lhs: double_scratch, rhs: input });
        self.bind(done);
        Ok(())
    }

    pub fn test_double_is_int32(
        &mut self,
        input: DoubleRegister,
        scratch1: Register,
        scratch2: Register,
        double_scratch: DoubleRegister,
    ) -> Result<(), EmitError> {
        self.try_double_to_int32_exact(scratch1, input, scratch2, double_scratch)
    }

    /// Condition codes: lt iff the sign bit of `input` is set.
    pub fn test_double_sign_bit(&mut self, input: DoubleRegister, scratch: Register) {
        self.emit(Inst::MovDToGpr { dst: scratch, src: input });
        self.emit(Inst::Cmp { size: OpSize::S64, lhs: scratch, rhs: Operand::Imm(0) });
    }

    /// Floor `input` into the int32 `result`. Branches to `exact` when the
    /// input was integral, to `done` when it was not, and falls through when
    /// the input is NaN, infinite or out of range.
    #[allow(clippy::too_many_arguments)]
    pub fn try_int32_floor(
        &mut self,
        result: Register,
        input: DoubleRegister,
        input_high: Register,
        scratch: Register,
        double_scratch: DoubleRegister,
        done: Label,
        exact: Label,
    ) -> Result<(), EmitError> {
        self.check_not_aliased("try_int32_floor", &[result, input_high])?;
        check_double_scratch("try_int32_floor", input, double_scratch)?;
        let exception = self.new_label();

        self.emit(Inst::MovDToGpr { dst: input_high, src: input });
        self.alu(AluOp::Shr, OpSize::S64, input_high, input_high, 32i64);

        self.extract_bit_mask(result, input_high, DOUBLE_EXPONENT_MASK);
        self.cmp_p(result, DOUBLE_EXPONENT_ALL_ONES);
        self.branch(Cond::Eq, exception);

        self.convert_double_to_int64(input, result, double_scratch, RoundingMode::ToMinusInf);
        self.test_if_int32(result, R0);
        self.branch(Cond::Ne, exception);

        self.emit(Inst::MovDToGpr { dst: scratch, src: double_scratch });
        self.emit(Inst::CvtIntToFloat { dst: double_scratch, src: scratch, from: IntKind::I32, to: FloatKind::F64 });
        self.emit(Inst::FCmp { lhs: double_scratch, rhs: input });
        self.branch(Cond::Eq, exact);
        self.b(done);

        self.bind(exception);
        Ok(())
    }

    /// Jump to `no_nan_inf` unless the double whose bits are in `bits` is
    /// NaN or infinite. Clobbers r0.
    fn branch_if_finite(&mut self, bits: Register, no_nan_inf: Label) {
        self.extract_bit_mask(R0, bits, EXPONENT_MASK_64);
        self.cmp_p(R0, DOUBLE_EXPONENT_ALL_ONES);
        self.branch(Cond::Ne, no_nan_inf);
    }

    /// output = floor(input). NaN, infinities and zeros pass through
    /// unchanged. Clobbers `scratch`, r0 and the scratch double register,
    /// which must not be the input.
    pub fn float_floor64(&mut self, output: DoubleRegister, input: DoubleRegister, scratch: Register) -> Result<(), EmitError> {
        check_double_scratch("float_floor64", input, regs::SCRATCH_DOUBLE)?;
        let no_nan_inf = self.new_label();
        let do_floor = self.new_label();
        let done = self.new_label();

        self.emit(Inst::MovDToGpr { dst: scratch, src: input });
        self.branch_if_finite(scratch, no_nan_inf);
        self.move_double(output, input);
        self.b(done);
        self.bind(no_nan_inf);

        self.load_double_literal(regs::SCRATCH_DOUBLE, 0.0, R0);
        self.emit(Inst::FCmp { lhs: input, rhs: regs::SCRATCH_DOUBLE });
        self.branch(Cond::Ne, do_floor);
        self.move_double(output, input);
        self.b(done);

        self.bind(do_floor);
        self.emit(Inst::RoundD { dst: output, src: input, mode: RoundingMode::ToMinusInf });
        self.bind(done);
        Ok(())
    }

    /// output = ceil(input). NaN, infinities and zeros pass through; inputs
    /// in (-1, 0) give -0. Clobbers `scratch`, r0 and the scratch double
    /// register, which must not be the input.
    pub fn float_ceiling64(&mut self, output: DoubleRegister, input: DoubleRegister, scratch: Register) -> Result<(), EmitError> {
        check_double_scratch("float_ceiling64", input, regs::SCRATCH_DOUBLE)?;
        let no_nan_inf = self.new_label();
        let not_zero = self.new_label();
        let do_ceil = self.new_label();
        let done = self.new_label();

        self.emit(Inst::MovDToGpr { dst: scratch, src: input });
        self.branch_if_finite(scratch, no_nan_inf);
        self.move_double(output, input);
        self.b(done);
        self.bind(no_nan_inf);

        self.load_double_literal(regs::SCRATCH_DOUBLE, -1.0, R0);
        self.emit(Inst::FCmp { lhs: input, rhs: regs::SCRATCH_DOUBLE });
        self.branch(Cond::Le, do_ceil);
        // Positive bit patterns, denormals included, take the regular path.
        self.emit(Inst::Cmp { size: OpSize::S64, lhs: scratch, rhs: Operand::Imm(0) });
        self.branch(Cond::Gt, do_ceil);
        self.branch(Cond::Ne, not_zero);
        self.move_double(output, input);
        self.b(done);

        self.bind(not_zero);
        self.load_imm(R0, MINUS_ZERO_BITS as i64);
        self.emit(Inst::MovGprToD { dst: output, src: R0 });
        self.b(done);

        self.bind(do_ceil);
        self.emit(Inst::RoundD { dst: output, src: input, mode: RoundingMode::ToPlusInf });
        self.bind(done);
        Ok(())
    }

    /// Truncate `input` into `result` and jump to `done` when the value
    /// fits in an int32. Clobbers the scratch double register and r0.
    pub fn try_inline_truncate_double_to_i(&mut self, result: Register, input: DoubleRegister, done: Label) {
        self.convert_double_to_int64(input, result, regs::SCRATCH_DOUBLE, RoundingMode::ToZero);
        self.test_if_int32(result, R0);
        self.branch(Cond::Eq, done);
    }

    /// result = ToInt32(input) with modular wrap-around, falling back to the
    /// DoubleToI stub when the inline conversion overflows.
    pub fn truncate_double_to_i(&mut self, result: Register, input: DoubleRegister) {
        let done = self.new_label();
        self.try_inline_truncate_double_to_i(result, input, done);

        self.push(regs::LR);
        let size = WordWidth::DOUBLE_SIZE;
        self.store_double(input, MemOperand::new(regs::SP, -size));
        self.lay(regs::SP, MemOperand::new(regs::SP, -size));
        self.call_stub(Stub::DoubleToI { source: regs::SP, result, offset: 0 });
        self.lay(regs::SP, MemOperand::new(regs::SP, size));
        self.pop(regs::LR);

        self.bind(done);
    }

    /// result = ToInt32 of the heap number `object`.
    pub fn truncate_heap_number_to_i(&mut self, result: Register, object: Register) -> Result<(), EmitError> {
        self.check_not_aliased("truncate_heap_number_to_i", &[result, object])?;
        let done = self.new_label();
        let value_offset = self.layout.heap_number_value_offset();
        self.load_double(regs::SCRATCH_DOUBLE, field_mem(object, value_offset));
        self.try_inline_truncate_double_to_i(result, regs::SCRATCH_DOUBLE, done);

        self.push(regs::LR);
        self.call_stub(Stub::DoubleToI { source: object, result, offset: field_mem(object, value_offset).offset() });
        self.pop(regs::LR);

        self.bind(done);
        Ok(())
    }

    /// result = ToInt32 of a Smi or heap number; anything else jumps to
    /// `not_number`.
    pub fn truncate_number_to_i(
        &mut self,
        object: Register,
        result: Register,
        heap_number_map: Register,
        scratch: Register,
        not_number: Label,
    ) -> Result<(), EmitError> {
        self.check_not_aliased("truncate_number_to_i", &[result, object])?;
        let done = self.new_label();
        self.untag_and_jump_if_smi(result, object, done);
        self.jump_if_not_heap_number(object, heap_number_map, scratch, not_number);
        self.truncate_heap_number_to_i(result, object)?;
        self.bind(done);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::reg::{D1, D2, D13, R2, R3, R4};
    use crate::config::EmitterConfig;

    fn masm() -> MacroAssembler {
        MacroAssembler::new(EmitterConfig::default())
    }

    #[test]
    fn test_floor_rejects_scratch_double_input() {
        let mut m = masm();
        assert!(m.float_floor64(D1, D13, R2).is_err());
        assert!(m.float_ceiling64(D1, D13, R2).is_err());
        assert!(m.float_floor64(D13, D1, R2).is_ok());
    }

    #[test]
    fn test_ceiling_minus_zero_constant() {
        let mut m = masm();
        m.float_ceiling64(D1, D2, R2).unwrap();
        assert!(m.insts().contains(&Inst::LoadImm { dst: R0, imm: i64::MIN }));
        assert!(m.finish().is_ok());
    }

    #[test]
    fn test_try_double_to_int32_exact_scratch() {
        let mut m = masm();
        assert!(m.try_double_to_int32_exact(R2, D1, R3, D1).is_err());
        m.try_double_to_int32_exact(R2, D1, R3, D2).unwrap();
        assert!(matches!(m.insts().last(), Some(Inst::FCmp { lhs: D2, rhs: D1 })));
    }

    #[test]
    fn test_truncate_uses_stub_fallback() {
        let mut m = masm();
        m.truncate_double_to_i(R2, D1);
        assert!(m.insts().iter().any(|i| matches!(
            i,
            Inst::Call(crate::asm::Target::Stub(Stub::DoubleToI { source: regs::SP, result: R2, offset: 0 }))
        )));
        assert!(m.finish().is_ok());
    }

    #[test]
    fn test_truncate_heap_number_offset() {
        let mut m = masm();
        m.truncate_heap_number_to_i(R2, R3).unwrap();
        let value_offset = m.layout().heap_number_value_offset();
        assert!(m.insts().iter().any(|i| matches!(
            i,
            Inst::Call(crate::asm::Target::Stub(Stub::DoubleToI { source: R3, offset, .. })) if *offset == value_offset - 1
        )));
        assert!(m.truncate_heap_number_to_i(R3, R3).is_err());
    }

    #[test]
    fn test_try_int32_floor_aliasing() {
        let mut m = masm();
        let done = m.new_label();
        let exact = m.new_label();
        assert!(m.try_int32_floor(R2, D1, R2, R4, D2, done, exact).is_err());
        assert!(m.try_int32_floor(R2, D1, R3, R4, D2, done, exact).is_ok());
    }
}
