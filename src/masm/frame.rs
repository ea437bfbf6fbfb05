//! Stack frames.
//!
//! A standard frame, from the caller's stack pointer downwards:
//!
//! ```text
//!   return address   <- fp + 1 * ptr
//!   caller fp        <- fp
//!   context          <- fp - 1 * ptr
//!   marker           <- fp - 2 * ptr   (Smi frame type, or the function)
//!   code object      <- fp - 3 * ptr   (typed frames only)
//! ```
//!
//! An exit frame wraps a transition into foreign code. It records its frame
//! pointer and the current context in the isolate's `c_entry_fp` and
//! `context` cells so the runtime can walk the stack, then reserves the
//! argument area the native ABI wants below an aligned stack pointer.

use super::MacroAssembler;
use crate::asm::reg::{D0, D2, NO_REG, R0, R1, R5};
use crate::asm::{DoubleRegister, MemOperand, Register, Target, regs};
use crate::error::EmitError;
use crate::layout::ExternalRef;

pub use crate::layout::FrameType;

impl MacroAssembler {
    // ==================== Standard frames ====================

    /// Push return address, caller fp, context and an optional marker.
    pub fn push_fixed_frame(&mut self, marker: Register) {
        if marker.is_valid() {
            self.push_list(&[regs::LR, regs::FP, regs::CP, marker]);
        } else {
            self.push_list(&[regs::LR, regs::FP, regs::CP]);
        }
    }

    pub fn pop_fixed_frame(&mut self, marker: Register) {
        if marker.is_valid() {
            self.pop_list(&[regs::LR, regs::FP, regs::CP, marker]);
        } else {
            self.pop_list(&[regs::LR, regs::FP, regs::CP]);
        }
    }

    /// Frame setup at the start of a code stub.
    pub fn stub_prologue(&mut self) {
        self.push_fixed_frame(NO_REG);
        self.load_smi_literal(R0, FrameType::Stub as i64);
        self.push(R0);
        let size = self.layout.fixed_frame_size_from_fp();
        self.lay(regs::FP, MemOperand::new(regs::SP, size));
        self.push_frame_scope();
    }

    /// Frame setup at the start of a JavaScript function; the function
    /// (r3) takes the marker slot.
    pub fn prologue(&mut self) {
        self.push_fixed_frame(regs::ARGS[1]);
        let size = self.layout.fixed_frame_size_from_fp();
        self.lay(regs::FP, MemOperand::new(regs::SP, size));
        self.push_frame_scope();
    }

    /// Build a typed frame: fixed frame with a Smi marker plus the code
    /// object. Clobbers ip and r0.
    pub fn enter_frame(&mut self, frame_type: FrameType) {
        self.trace(format_args!("enter_frame {:?}", frame_type));
        self.load_smi_literal(regs::IP, frame_type as i64);
        self.push_fixed_frame(regs::IP);
        self.mov_external(R0, ExternalRef::CodeObject);
        self.push(R0);
        let size = self.layout.fixed_frame_size_from_fp() + self.ptr();
        self.lay(regs::FP, MemOperand::new(regs::SP, size));
        self.push_frame_scope();
    }

    /// Tear down the current frame and drop `stack_adjustment` extra bytes
    /// of caller stack. Returns the pc offset where the frame has ended.
    /// Clobbers r1.
    pub fn leave_frame(&mut self, frame_type: FrameType, stack_adjustment: i32) -> usize {
        self.trace(format_args!("leave_frame {:?}", frame_type));
        let caller_pc = self.layout.caller_pc_offset();
        let caller_sp = self.layout.caller_sp_offset();
        let caller_fp = self.layout.caller_fp_offset();
        self.load_p(regs::LR, MemOperand::new(regs::FP, caller_pc));
        self.lay(R1, MemOperand::new(regs::FP, caller_sp + stack_adjustment));
        self.load_p(regs::FP, MemOperand::new(regs::FP, caller_fp));
        self.mov(regs::SP, R1);
        self.pop_frame_scope();
        self.pc_offset()
    }

    // ==================== Exit frames ====================

    /// Alignment of the stack pointer at calls into foreign code.
    pub fn activation_frame_alignment(&self) -> i64 {
        self.config.frame_alignment.bytes()
    }

    /// Enter an exit frame with `stack_space` slots for the callee.
    /// Clobbers r0 and r1.
    pub fn enter_exit_frame(&mut self, save_doubles: bool, stack_space: i32) -> Result<(), EmitError> {
        if stack_space <= 0 {
            return Err(EmitError::Unsupported("exit frame needs a positive stack space"));
        }
        self.trace(format_args!("enter_exit_frame save_doubles={} stack_space={}", save_doubles, stack_space));
        let ptr = self.ptr();

        self.push_list(&[regs::LR, regs::FP]);
        self.mov(regs::FP, regs::SP);
        // Room for the saved entry sp and the code object.
        let frame_size = self.layout.exit_frame_size();
        self.lay(regs::SP, MemOperand::new(regs::SP, -frame_size));

        let sp_offset = self.layout.exit_frame_sp_offset();
        let code_offset = self.layout.exit_frame_code_offset();
        if self.emit_debug_code() {
            self.store_imm_p(MemOperand::new(regs::FP, sp_offset), 0);
        }
        self.mov_external(R1, ExternalRef::CodeObject);
        self.store_p(R1, MemOperand::new(regs::FP, code_offset));

        self.mov_external(R1, ExternalRef::CEntryFp);
        self.store_p(regs::FP, MemOperand::new(R1, 0));
        self.mov_external(R1, ExternalRef::Context);
        self.store_p(regs::CP, MemOperand::new(R1, 0));

        if save_doubles {
            self.multi_push_doubles(regs::CALLER_SAVED_DOUBLES, regs::SP);
        }

        self.lay(regs::SP, MemOperand::new(regs::SP, -stack_space * ptr));
        let alignment_log2 = self.config.frame_alignment.log2();
        self.clear_right_imm(regs::SP, regs::SP, alignment_log2);

        let slots = self.layout.required_stack_frame_slots();
        self.store_imm_p(MemOperand::new(regs::SP, -slots * ptr), 0);
        self.lay(regs::SP, MemOperand::new(regs::SP, -slots * ptr));

        // The recorded sp points just before the return address slot.
        let sp_slot = self.layout.stack_frame_sp_slot();
        self.lay(R1, MemOperand::new(regs::SP, sp_slot * ptr));
        self.store_p(R1, MemOperand::new(regs::FP, sp_offset));
        self.push_frame_scope();
        Ok(())
    }

    /// Leave an exit frame. When `argument_count` is valid it is dropped
    /// from the stack as well, in slots or, with `argument_count_is_length`,
    /// in bytes. Clobbers ip, r0, r1 and, with `save_doubles`, r5.
    pub fn leave_exit_frame(
        &mut self,
        save_doubles: bool,
        argument_count: Register,
        restore_context: bool,
        argument_count_is_length: bool,
    ) {
        self.trace(format_args!("leave_exit_frame argc={}", argument_count));
        if save_doubles {
            let frame_size = self.layout.exit_frame_size();
            let saved = regs::CALLER_SAVED_DOUBLES.count() as i32 * crate::asm::WordWidth::DOUBLE_SIZE;
            self.lay(R5, MemOperand::new(regs::FP, -(frame_size + saved)));
            self.multi_pop_doubles(regs::CALLER_SAVED_DOUBLES, R5);
        }

        self.mov_external(regs::IP, ExternalRef::CEntryFp);
        self.store_imm_p(MemOperand::new(regs::IP, 0), 0);

        if restore_context {
            self.mov_external(regs::IP, ExternalRef::Context);
            self.load_p(regs::CP, MemOperand::new(regs::IP, 0));
        }
        if self.emit_debug_code() {
            self.mov_external(regs::IP, ExternalRef::Context);
            self.store_imm_p(MemOperand::new(regs::IP, 0), 0);
        }

        self.leave_frame(FrameType::Exit, 0);

        if argument_count.is_valid() {
            if !argument_count_is_length {
                let log2 = self.width().pointer_size_log2() as i64;
                self.shift_left_p(argument_count, argument_count, log2);
            }
            self.lay(regs::SP, MemOperand::indexed(regs::SP, argument_count, 0));
        }
    }

    // ==================== Safepoints ====================

    /// Spill every allocatable register into the block the safepoint
    /// tables expect.
    pub fn push_safepoint_registers(&mut self) {
        let num_unsaved = (regs::NUM_SAFEPOINT_REGISTERS - regs::ALLOCATABLE.count()) as i32;
        if num_unsaved > 0 {
            let ptr = self.ptr();
            self.lay(regs::SP, MemOperand::new(regs::SP, -num_unsaved * ptr));
        }
        self.multi_push(regs::ALLOCATABLE, regs::SP);
    }

    pub fn pop_safepoint_registers(&mut self) {
        let num_unsaved = (regs::NUM_SAFEPOINT_REGISTERS - regs::ALLOCATABLE.count()) as i32;
        self.multi_pop(regs::ALLOCATABLE, regs::SP);
        if num_unsaved > 0 {
            let ptr = self.ptr();
            self.lay(regs::SP, MemOperand::new(regs::SP, num_unsaved * ptr));
        }
    }

    /// Slot index of `reg` in the spill block; lower codes sit closer to sp.
    pub fn safepoint_register_stack_index(reg: Register) -> i32 {
        regs::ALLOCATABLE.codes().take_while(|&c| c < reg.code()).count() as i32
    }

    fn safepoint_register_slot(&self, reg: Register) -> MemOperand {
        MemOperand::new(regs::SP, Self::safepoint_register_stack_index(reg) * self.ptr())
    }

    /// Overwrite the spilled value of `dst` with `src`.
    pub fn store_to_safepoint_register_slot(&mut self, src: Register, dst: Register) {
        let mem = self.safepoint_register_slot(dst);
        self.store_p(src, mem);
    }

    pub fn load_from_safepoint_register_slot(&mut self, dst: Register, src: Register) {
        let mem = self.safepoint_register_slot(src);
        self.load_p(dst, mem);
    }

    // ==================== Calls into C ====================

    /// Words of arguments that do not fit in argument registers.
    pub fn calculate_stack_passed_words(num_reg_arguments: i32, num_double_arguments: i32) -> i32 {
        let mut words = 0;
        let num_double_regs = DoubleRegister::NUM_REGISTERS as i32;
        if num_double_arguments > num_double_regs {
            words += 2 * (num_double_arguments - num_double_regs);
        }
        let num_arg_regs = regs::NUM_REGISTER_ARGS as i32;
        if num_reg_arguments > num_arg_regs {
            words += num_reg_arguments - num_arg_regs;
        }
        words
    }

    /// Reserve the ABI area and stack arguments for a C call. With an
    /// alignment above pointer size the old sp is saved above the
    /// arguments in `scratch`'s stead.
    pub fn prepare_call_c_function(&mut self, num_reg_arguments: i32, num_double_arguments: i32, scratch: Register) {
        let ptr = self.ptr();
        let words = Self::calculate_stack_passed_words(num_reg_arguments, num_double_arguments);
        let mut stack_space = self.layout.required_stack_frame_slots();
        if self.activation_frame_alignment() > ptr as i64 {
            self.mov(scratch, regs::SP);
            self.lay(regs::SP, MemOperand::new(regs::SP, -(words + 1) * ptr));
            let log2 = self.config.frame_alignment.log2();
            self.clear_right_imm(regs::SP, regs::SP, log2);
            self.store_p(scratch, MemOperand::new(regs::SP, words * ptr));
        } else {
            stack_space += words;
        }
        self.lay(regs::SP, MemOperand::new(regs::SP, -stack_space * ptr));
    }

    /// Call the C function `function` and release what
    /// `prepare_call_c_function` reserved.
    pub fn call_c_function(
        &mut self,
        function: ExternalRef,
        num_reg_arguments: i32,
        num_double_arguments: i32,
    ) -> Result<(), EmitError> {
        self.mov_external(regs::IP, function);
        self.call_c_function_reg(regs::IP, num_reg_arguments, num_double_arguments)
    }

    pub fn call_c_function_reg(
        &mut self,
        function: Register,
        num_reg_arguments: i32,
        num_double_arguments: i32,
    ) -> Result<(), EmitError> {
        if !self.has_frame() {
            return Err(EmitError::FrameRequired("call_c_function"));
        }
        self.trace(format_args!("call_c_function {} ({} args)", function, num_reg_arguments));
        self.call(Target::Reg(function));

        let ptr = self.ptr();
        let words = Self::calculate_stack_passed_words(num_reg_arguments, num_double_arguments);
        let stack_space = self.layout.required_stack_frame_slots() + words;
        if self.activation_frame_alignment() > ptr as i64 {
            self.load_p(regs::SP, MemOperand::new(regs::SP, stack_space * ptr));
        } else {
            self.lay(regs::SP, MemOperand::new(regs::SP, stack_space * ptr));
        }
        Ok(())
    }

    pub fn mov_to_float_parameter(&mut self, src: DoubleRegister) {
        self.move_double(regs::FLOAT_PARAM, src);
    }

    /// Move two double parameters into d0 and d2.
    pub fn mov_to_float_parameters(&mut self, src1: DoubleRegister, src2: DoubleRegister) -> Result<(), EmitError> {
        if src2 == D0 {
            if src1 == D2 {
                return Err(EmitError::Unsupported("swapping float parameters d0 and d2"));
            }
            self.move_double(D2, src2);
            self.move_double(D0, src1);
        } else {
            self.move_double(D0, src1);
            self.move_double(D2, src2);
        }
        Ok(())
    }

    pub fn mov_to_float_result(&mut self, src: DoubleRegister) {
        self.move_double(regs::FLOAT_RESULT, src);
    }

    pub fn mov_from_float_result(&mut self, dst: DoubleRegister) {
        self.move_double(dst, regs::FLOAT_RESULT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::reg::{R2, R3, R7, R13};
    use crate::asm::{Inst, MemType};
    use crate::config::{EmitterConfig, FrameAlignment};

    fn masm() -> MacroAssembler {
        MacroAssembler::new(EmitterConfig::default())
    }

    #[test]
    fn test_safepoint_stack_index() {
        assert_eq!(MacroAssembler::safepoint_register_stack_index(R2), 0);
        assert_eq!(MacroAssembler::safepoint_register_stack_index(R7), 5);
        assert_eq!(MacroAssembler::safepoint_register_stack_index(R13), 8);
    }

    #[test]
    fn test_stack_passed_words() {
        assert_eq!(MacroAssembler::calculate_stack_passed_words(5, 0), 0);
        assert_eq!(MacroAssembler::calculate_stack_passed_words(7, 0), 2);
        assert_eq!(MacroAssembler::calculate_stack_passed_words(2, 18), 4);
    }

    #[test]
    fn test_enter_frame_tracks_scope() {
        let mut m = masm();
        assert!(!m.has_frame());
        m.enter_frame(FrameType::Internal);
        assert!(m.has_frame());
        m.leave_frame(FrameType::Internal, 0);
        assert!(!m.has_frame());
    }

    #[test]
    fn test_exit_frame_records_fp_before_context() {
        let mut m = masm();
        m.enter_exit_frame(false, 2).unwrap();
        let insts = m.insts();
        let fp_ext = insts
            .iter()
            .position(|i| matches!(i, Inst::LoadExternal { ext: ExternalRef::CEntryFp, .. }))
            .unwrap();
        let cp_ext = insts
            .iter()
            .position(|i| matches!(i, Inst::LoadExternal { ext: ExternalRef::Context, .. }))
            .unwrap();
        assert!(fp_ext < cp_ext);
        assert!(matches!(insts[fp_ext + 1], Inst::Store { src: regs::FP, .. }));
        assert!(matches!(insts[cp_ext + 1], Inst::Store { src: regs::CP, .. }));
        assert!(m.enter_exit_frame(false, 0).is_err());
    }

    #[test]
    fn test_leave_exit_frame_scales_argument_count() {
        let mut m = masm();
        m.enter_exit_frame(false, 1).unwrap();
        m.leave_exit_frame(false, R2, true, false);
        assert!(m.insts().iter().any(|i| matches!(
            i,
            Inst::Alu { op: crate::asm::AluOp::Shl, dst: R2, rhs: crate::asm::Operand::Imm(3), .. }
        )));
        assert!(!m.has_frame());
    }

    #[test]
    fn test_call_c_function_requires_frame() {
        let mut m = masm();
        assert_eq!(
            m.call_c_function(ExternalRef::CFunction(1), 2, 0),
            Err(EmitError::FrameRequired("call_c_function"))
        );
    }

    #[test]
    fn test_aligned_c_call_restores_saved_sp() {
        let config = EmitterConfig::default().with_frame_alignment(FrameAlignment::Sixteen);
        let mut m = MacroAssembler::new(config);
        m.set_has_frame(true);
        m.prepare_call_c_function(2, 0, R3);
        m.call_c_function(ExternalRef::CFunction(1), 2, 0).unwrap();
        assert!(matches!(
            m.insts().last(),
            Some(Inst::Load { dst: regs::SP, ty: MemType::U64, .. })
        ));
    }

    #[test]
    fn test_float_parameter_swap() {
        let mut m = masm();
        assert!(m.mov_to_float_parameters(D2, D0).is_err());
        m.mov_to_float_parameters(crate::asm::reg::D4, D0).unwrap();
        assert_eq!(m.insts()[0], Inst::MovD { dst: D2, src: D0 });
    }
}
