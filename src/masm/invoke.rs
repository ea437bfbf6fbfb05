//! Function invocation and runtime calls.
//!
//! Calling convention for JavaScript functions:
//!
//! ```text
//!   r2  actual argument count
//!   r3  function
//!   r4  expected argument count (formal parameters)
//!   r5  new.target
//! ```
//!
//! When the counts may differ the call goes through the arguments adaptor
//! trampoline, which reshapes the arguments and then calls the function's
//! code entry itself.

use std::fmt;

use super::{MacroAssembler, field_mem};
use crate::asm::reg::{R2, R3, R4, R5, R6};
use crate::asm::{Cond, Label, Register, Stub, Target, regs};
use crate::error::EmitError;
use crate::layout::{DONT_ADAPT_ARGUMENTS_SENTINEL, ExternalRef, RootIndex, RuntimeFunction, SaveFpRegsMode};

/// An argument count, known at emission time or held in a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterCount {
    Imm(i32),
    Reg(Register),
}

impl fmt::Display for ParameterCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterCount::Imm(n) => write!(f, "#{}", n),
            ParameterCount::Reg(r) => write!(f, "{}", r),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeFlag {
    Call,
    Jump,
}

impl MacroAssembler {
    /// Compare expected and actual argument counts and route mismatches
    /// through the arguments adaptor. Returns whether the counts are known
    /// to differ, in which case the adaptor is the whole invocation and the
    /// caller must not emit the direct call. Otherwise, code that went
    /// through the adaptor continues at `done`.
    pub fn invoke_prologue(
        &mut self,
        expected: ParameterCount,
        actual: ParameterCount,
        done: Label,
        flag: InvokeFlag,
    ) -> Result<bool, EmitError> {
        if let ParameterCount::Reg(reg) = expected {
            self.check_register("invoke_prologue expected count", R4, reg)?;
        }
        if let ParameterCount::Reg(reg) = actual {
            self.check_register("invoke_prologue actual count", R2, reg)?;
        }

        let mut definitely_matches = false;
        let mut definitely_mismatches = false;
        let regular_invoke = self.new_label();

        match (expected, actual) {
            (ParameterCount::Imm(expected), ParameterCount::Imm(actual)) => {
                self.load_imm(R2, actual as i64);
                if expected == actual || expected == DONT_ADAPT_ARGUMENTS_SENTINEL {
                    definitely_matches = true;
                } else {
                    definitely_mismatches = true;
                    self.load_imm(R4, expected as i64);
                }
            }
            (ParameterCount::Imm(expected), ParameterCount::Reg(_)) => {
                if expected == DONT_ADAPT_ARGUMENTS_SENTINEL {
                    definitely_matches = true;
                } else {
                    self.load_imm(R4, expected as i64);
                    self.cmp_p(R2, expected as i64);
                    self.branch(Cond::Eq, regular_invoke);
                }
            }
            (ParameterCount::Reg(_), actual) => {
                // The expected count may be the sentinel at run time too.
                self.cmp_p(R4, DONT_ADAPT_ARGUMENTS_SENTINEL as i64);
                self.branch(Cond::Eq, regular_invoke);
                match actual {
                    ParameterCount::Imm(n) => {
                        self.load_imm(R2, n as i64);
                        self.cmp_p(R4, n as i64);
                    }
                    ParameterCount::Reg(reg) => self.cmp_p(R4, reg),
                }
                self.branch(Cond::Eq, regular_invoke);
            }
        }
        self.trace(format_args!(
            "invoke_prologue expected={} actual={} matches={} mismatches={}",
            expected, actual, definitely_matches, definitely_mismatches
        ));

        if !definitely_matches {
            match flag {
                InvokeFlag::Call => {
                    self.call_stub(Stub::ArgumentsAdaptor);
                    if !definitely_mismatches {
                        self.b(done);
                    }
                }
                InvokeFlag::Jump => self.tail_call_stub(Stub::ArgumentsAdaptor),
            }
            self.bind(regular_invoke);
        }
        Ok(definitely_mismatches)
    }

    /// Invoke the code of the function in r3. `new_target` is r5 or
    /// `NO_REG`, in which case r5 is set to undefined.
    pub fn invoke_function_code(
        &mut self,
        function: Register,
        new_target: Register,
        expected: ParameterCount,
        actual: ParameterCount,
        flag: InvokeFlag,
    ) -> Result<(), EmitError> {
        if flag == InvokeFlag::Call && !self.has_frame() {
            return Err(EmitError::FrameRequired("invoke_function_code"));
        }
        self.check_register("invoke_function_code function", R3, function)?;
        if new_target.is_valid() {
            self.check_register("invoke_function_code new_target", R5, new_target)?;
        } else {
            self.load_root(R5, RootIndex::UndefinedValue);
        }

        let done = self.new_label();
        let definitely_mismatches = self.invoke_prologue(expected, actual, done, flag)?;
        if !definitely_mismatches {
            // Go through the code entry field so recompiled code is picked up.
            let code_entry = self.layout.js_function_code_entry_offset();
            self.load_p(regs::IP, field_mem(function, code_entry));
            match flag {
                InvokeFlag::Call => self.call(Target::Reg(regs::IP)),
                InvokeFlag::Jump => self.jump(Target::Reg(regs::IP)),
            }
            self.bind(done);
        }
        Ok(())
    }

    /// Invoke the function in r3 with its formal parameter count as the
    /// expected count. Loads the function's context into cp.
    pub fn invoke_function(
        &mut self,
        function: Register,
        new_target: Register,
        actual: ParameterCount,
        flag: InvokeFlag,
    ) -> Result<(), EmitError> {
        if flag == InvokeFlag::Call && !self.has_frame() {
            return Err(EmitError::FrameRequired("invoke_function"));
        }
        self.check_register("invoke_function function", R3, function)?;

        let expected_reg = R4;
        let temp_reg = R6;
        let shared = self.layout.js_function_shared_offset();
        let context = self.layout.js_function_context_offset();
        let formal_count = self.layout.shared_formal_parameter_count_offset();
        self.load_p(temp_reg, field_mem(function, shared));
        self.load_p(regs::CP, field_mem(function, context));
        self.load_w(expected_reg, field_mem(temp_reg, formal_count));
        if !self.width().is_64bit() {
            self.smi_untag(expected_reg, expected_reg);
        }

        self.invoke_function_code(function, new_target, ParameterCount::Reg(expected_reg), actual, flag)
    }

    /// Invoke the function in r3 with a caller supplied expected count.
    pub fn invoke_function_with_expected(
        &mut self,
        function: Register,
        expected: ParameterCount,
        actual: ParameterCount,
        flag: InvokeFlag,
    ) -> Result<(), EmitError> {
        if flag == InvokeFlag::Call && !self.has_frame() {
            return Err(EmitError::FrameRequired("invoke_function"));
        }
        self.check_register("invoke_function function", R3, function)?;
        let context = self.layout.js_function_context_offset();
        self.load_p(regs::CP, field_mem(function, context));
        self.invoke_function_code(function, crate::asm::reg::NO_REG, expected, actual, flag)
    }

    // ==================== Runtime ====================

    /// Call a runtime function with `num_arguments` arguments on the stack.
    /// The result comes back in r2.
    pub fn call_runtime(
        &mut self,
        function: RuntimeFunction,
        num_arguments: i32,
        save_doubles: SaveFpRegsMode,
    ) -> Result<(), EmitError> {
        if function.nargs() >= 0 && function.nargs() != num_arguments {
            return Err(EmitError::ArgumentCountMismatch {
                name: function.name(),
                expected: function.nargs(),
                got: num_arguments,
            });
        }
        if !self.has_frame() {
            return Err(EmitError::FrameRequired("call_runtime"));
        }
        self.emit_runtime_call(function, num_arguments, save_doubles);
        Ok(())
    }

    pub(crate) fn emit_runtime_call(&mut self, function: RuntimeFunction, num_arguments: i32, save_doubles: SaveFpRegsMode) {
        self.load_imm(R2, num_arguments as i64);
        self.mov_external(R3, ExternalRef::Runtime(function));
        let result_size = if self.width().is_64bit() { function.result_size() } else { 1 };
        self.call_stub(Stub::CEntry { result_size, save_doubles });
    }

    pub fn call_external_reference(&mut self, ext: ExternalRef, num_arguments: i32) -> Result<(), EmitError> {
        if !self.has_frame() {
            return Err(EmitError::FrameRequired("call_external_reference"));
        }
        self.load_imm(R2, num_arguments as i64);
        self.mov_external(R3, ext);
        self.call_stub(Stub::CEntry { result_size: 1, save_doubles: SaveFpRegsMode::DontSave });
        Ok(())
    }

    pub fn tail_call_runtime(&mut self, function: RuntimeFunction, num_arguments: i32) {
        self.load_imm(R2, num_arguments as i64);
        self.jump_to_external_reference(ExternalRef::Runtime(function));
    }

    pub fn jump_to_external_reference(&mut self, ext: ExternalRef) {
        self.mov_external(R3, ext);
        self.tail_call_stub(Stub::CEntry { result_size: 1, save_doubles: SaveFpRegsMode::DontSave });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::Inst;
    use crate::asm::reg::R7;
    use crate::config::EmitterConfig;

    fn framed() -> MacroAssembler {
        let mut m = MacroAssembler::new(EmitterConfig::default());
        m.set_has_frame(true);
        m
    }

    fn adaptor_calls(m: &MacroAssembler) -> usize {
        m.insts()
            .iter()
            .filter(|i| matches!(i, Inst::Call(Target::Stub(Stub::ArgumentsAdaptor))))
            .count()
    }

    #[test]
    fn test_equal_immediates_call_directly() {
        let mut m = framed();
        m.invoke_function_code(R3, crate::asm::reg::NO_REG, ParameterCount::Imm(2), ParameterCount::Imm(2), InvokeFlag::Call)
            .unwrap();
        assert_eq!(adaptor_calls(&m), 0);
        assert!(m.insts().iter().any(|i| matches!(i, Inst::Call(Target::Reg(regs::IP)))));
    }

    #[test]
    fn test_sentinel_skips_adaptor() {
        let mut m = framed();
        let done = m.new_label();
        let mismatch = m
            .invoke_prologue(ParameterCount::Imm(DONT_ADAPT_ARGUMENTS_SENTINEL), ParameterCount::Imm(3), done, InvokeFlag::Call)
            .unwrap();
        assert!(!mismatch);
        assert_eq!(adaptor_calls(&m), 0);
    }

    #[test]
    fn test_different_immediates_only_adapt() {
        let mut m = framed();
        m.invoke_function_code(R3, R5, ParameterCount::Imm(1), ParameterCount::Imm(3), InvokeFlag::Call)
            .unwrap();
        assert_eq!(adaptor_calls(&m), 1);
        assert!(!m.insts().iter().any(|i| matches!(i, Inst::Call(Target::Reg(_)))));
        assert!(m.insts().contains(&Inst::LoadImm { dst: R4, imm: 1 }));
        assert!(m.insts().contains(&Inst::LoadImm { dst: R2, imm: 3 }));
    }

    #[test]
    fn test_register_counts_checked_at_run_time() {
        let mut m = framed();
        m.invoke_function_code(R3, R5, ParameterCount::Reg(R4), ParameterCount::Reg(R2), InvokeFlag::Call)
            .unwrap();
        assert_eq!(adaptor_calls(&m), 1);
        assert!(m.insts().iter().any(|i| matches!(i, Inst::Call(Target::Reg(regs::IP)))));
        assert!(m.finish().is_ok());
    }

    #[test]
    fn test_wrong_registers_rejected() {
        let mut m = framed();
        assert!(matches!(
            m.invoke_function_code(R7, R5, ParameterCount::Imm(0), ParameterCount::Imm(0), InvokeFlag::Call),
            Err(EmitError::WrongRegister { .. })
        ));
        let done = m.new_label();
        assert!(m.invoke_prologue(ParameterCount::Reg(R7), ParameterCount::Reg(R2), done, InvokeFlag::Call).is_err());
    }

    #[test]
    fn test_call_requires_frame_but_jump_does_not() {
        let mut m = MacroAssembler::new(EmitterConfig::default());
        assert_eq!(
            m.invoke_function(R3, R5, ParameterCount::Imm(0), InvokeFlag::Call),
            Err(EmitError::FrameRequired("invoke_function"))
        );
        assert!(m.invoke_function(R3, R5, ParameterCount::Imm(0), InvokeFlag::Jump).is_ok());
    }

    #[test]
    fn test_call_runtime_checks_argument_count() {
        let mut m = framed();
        assert_eq!(
            m.call_runtime(RuntimeFunction::AllocateInTargetSpace, 1, SaveFpRegsMode::DontSave),
            Err(EmitError::ArgumentCountMismatch { name: "AllocateInTargetSpace", expected: 2, got: 1 })
        );
        m.call_runtime(RuntimeFunction::StackGuard, 0, SaveFpRegsMode::DontSave).unwrap();
        assert_eq!(
            m.insts(),
            &[
                Inst::LoadImm { dst: R2, imm: 0 },
                Inst::LoadExternal { dst: R3, ext: ExternalRef::Runtime(RuntimeFunction::StackGuard) },
                Inst::Call(Target::Stub(Stub::CEntry { result_size: 1, save_doubles: SaveFpRegsMode::DontSave })),
            ]
        );
    }

    #[test]
    fn test_tail_call_runtime_jumps() {
        let mut m = MacroAssembler::new(EmitterConfig::default());
        m.tail_call_runtime(RuntimeFunction::NumberToString, 1);
        assert!(matches!(m.insts().last(), Some(Inst::Jump(Target::Stub(Stub::CEntry { .. })))));
    }
}
