//! The macro-assembler.
//!
//! `MacroAssembler` is the emission context: it owns the code buffer, the
//! immutable emitter configuration and the heap layout, and tracks whether a
//! frame is open. Operations are spread over submodules by concern; every
//! one of them is an `impl MacroAssembler` block.
//!
//! Register conventions (see `asm::regs`): r0 and r1 are free scratch, ip is
//! scratch inside a single operation, r14 holds return addresses.

pub mod alloc;
pub mod arith;
pub mod barrier;
pub mod convert;
pub mod frame;
pub mod invoke;
pub mod scenarios;

use std::fmt;

use crate::asm::reg::{NO_REG, R0, R1};
use crate::asm::{
    Code, CodeBuffer, Cond, DoubleRegister, FAluOp, FloatKind, Inst, IntKind, Label, MemOperand,
    MemType, OpSize, Operand, RegList, Register, RoundingMode, Stub, Target, WordWidth,
    are_aliased, regs,
};
use crate::config::EmitterConfig;
use crate::error::EmitError;
use crate::layout::{
    AbortReason, Counter, ExternalRef, HEAP_OBJECT_TAG, HeapLayout, RootIndex, RuntimeFunction,
    SaveFpRegsMode, instance_type,
};

pub use alloc::{AllocSize, AllocatedRegs, Allocation, AllocationFlags, MutableMode, TaggingMode};
pub use barrier::{
    LinkRegisterStatus, MarkColor, PointersToHereCheck, RememberedSetFinalAction, SmiCheck,
};
pub use frame::FrameType;
pub use invoke::{InvokeFlag, ParameterCount};

/// Memory operand for a field of a tagged heap object.
pub fn field_mem(object: Register, offset: i32) -> MemOperand {
    MemOperand::new(object, offset - HEAP_OBJECT_TAG)
}

/// Statistics gathered while emitting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitStats {
    /// Write barrier stub calls emitted
    pub write_barriers_static: u32,
    /// Abort sequences emitted
    pub aborts: u32,
}

/// The emission context for one code generation pass.
pub struct MacroAssembler {
    buf: CodeBuffer,
    config: EmitterConfig,
    layout: HeapLayout,
    /// Number of frames entered and not yet left
    frame_depth: u32,
    stats: EmitStats,
}

impl MacroAssembler {
    pub fn new(config: EmitterConfig) -> Self {
        let layout = HeapLayout::new(config.width);
        Self {
            buf: CodeBuffer::with_capacity(256),
            config,
            layout,
            frame_depth: 0,
            stats: EmitStats::default(),
        }
    }

    pub fn config(&self) -> &EmitterConfig {
        &self.config
    }

    pub fn layout(&self) -> &HeapLayout {
        &self.layout
    }

    pub fn width(&self) -> WordWidth {
        self.config.width
    }

    pub fn stats(&self) -> EmitStats {
        self.stats
    }

    pub fn emit_debug_code(&self) -> bool {
        self.config.debug_code
    }

    /// Pointer size in bytes.
    pub(crate) fn ptr(&self) -> i32 {
        self.config.width.pointer_size()
    }

    /// Operand size of pointer-sized operations.
    pub(crate) fn op(&self) -> OpSize {
        self.config.width.op_size()
    }

    /// Memory type of a pointer-sized access.
    pub(crate) fn ptr_ty(&self) -> MemType {
        match self.config.width {
            WordWidth::W32 => MemType::U32,
            WordWidth::W64 => MemType::U64,
        }
    }

    pub fn has_frame(&self) -> bool {
        self.frame_depth > 0
    }

    /// Declare that code emitted from now on runs inside (or outside) a
    /// frame built elsewhere.
    pub fn set_has_frame(&mut self, value: bool) {
        self.frame_depth = if value { self.frame_depth.max(1) } else { 0 };
    }

    pub(crate) fn push_frame_scope(&mut self) {
        self.frame_depth += 1;
    }

    pub(crate) fn pop_frame_scope(&mut self) {
        self.frame_depth = self.frame_depth.saturating_sub(1);
    }

    pub(crate) fn trace(&self, args: fmt::Arguments<'_>) {
        if self.config.trace {
            eprintln!("[masm] {}", args);
        }
    }

    pub(crate) fn check_not_aliased(
        &self,
        op: &'static str,
        registers: &[Register],
    ) -> Result<(), EmitError> {
        if are_aliased(registers) {
            let names: Vec<String> = registers.iter().map(|r| r.to_string()).collect();
            return Err(EmitError::AliasedRegisters(format!("{}({})", op, names.join(", "))));
        }
        Ok(())
    }

    pub(crate) fn check_register(
        &self,
        op: &'static str,
        expected: Register,
        got: Register,
    ) -> Result<(), EmitError> {
        if expected != got {
            return Err(EmitError::WrongRegister {
                op,
                expected: expected.to_string(),
                got: got.to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn check_valid(&self, op: &'static str, registers: &[Register]) -> Result<(), EmitError> {
        if registers.iter().any(|r| !r.is_valid()) {
            return Err(EmitError::InvalidRegister(op));
        }
        Ok(())
    }

    // ==================== Buffer ====================

    pub fn new_label(&mut self) -> Label {
        self.buf.new_label()
    }

    pub fn bind(&mut self, label: Label) {
        self.buf.bind(label);
    }

    pub fn emit(&mut self, inst: Inst) {
        self.buf.emit(inst);
    }

    pub fn pc_offset(&self) -> usize {
        self.buf.offset()
    }

    pub fn insts(&self) -> &[Inst] {
        self.buf.insts()
    }

    /// Finish the pass and hand out the instruction stream.
    pub fn finish(self) -> Result<Code, EmitError> {
        let width = self.config.width;
        let trace = self.config.trace;
        let barriers = self.stats.write_barriers_static;
        let code = self.buf.finalize(width)?;
        if trace {
            eprintln!(
                "[masm] finished: {} instructions, {} write barrier stub calls",
                code.len(),
                barriers
            );
        }
        Ok(code)
    }

    pub fn comment(&mut self, text: &str) {
        self.emit(Inst::Comment(text.to_string()));
    }

    pub fn stop(&mut self, msg: &str) {
        self.emit(Inst::Stop(msg.to_string()));
    }

    // ==================== Moves ====================

    pub fn mov(&mut self, dst: Register, src: Register) {
        if dst != src {
            self.emit(Inst::Mov { dst, src });
        }
    }

    pub fn load_imm(&mut self, dst: Register, imm: i64) {
        self.emit(Inst::LoadImm { dst, imm });
    }

    pub fn load_smi_literal(&mut self, dst: Register, value: i64) {
        let bits = self.width().smi_bits(value);
        self.load_imm(dst, bits as i64);
    }

    pub fn mov_external(&mut self, dst: Register, ext: ExternalRef) {
        self.emit(Inst::LoadExternal { dst, ext });
    }

    pub fn move_double(&mut self, dst: DoubleRegister, src: DoubleRegister) {
        if dst != src {
            self.emit(Inst::MovD { dst, src });
        }
    }

    /// Load a double constant through a general purpose register.
    pub fn load_double_literal(&mut self, dst: DoubleRegister, value: f64, scratch: Register) {
        self.load_imm(scratch, value.to_bits() as i64);
        self.emit(Inst::MovGprToD { dst, src: scratch });
    }

    // ==================== Memory ====================

    /// Rewrite `mem` so its displacement fits the addressing mode, using r1
    /// (or ip when r1 is taken) to hold the offset.
    fn legalize(&mut self, mem: MemOperand, keep: Register) -> MemOperand {
        if mem.is_encodable() {
            return mem;
        }
        let scratch = if mem.uses(R1) || keep == R1 { regs::IP } else { R1 };
        self.load_imm(scratch, mem.offset() as i64);
        if mem.index().is_valid() {
            self.emit(Inst::Lea {
                dst: scratch,
                mem: MemOperand::indexed(mem.index(), scratch, 0),
            });
        }
        MemOperand::indexed(mem.base(), scratch, 0)
    }

    pub fn load(&mut self, dst: Register, mem: MemOperand, ty: MemType) {
        let mem = self.legalize(mem, dst);
        self.emit(Inst::Load { dst, mem, ty });
    }

    pub fn store(&mut self, src: Register, mem: MemOperand, ty: MemType) {
        let mem = self.legalize(mem, src);
        self.emit(Inst::Store { src, mem, ty });
    }

    pub fn load_p(&mut self, dst: Register, mem: MemOperand) {
        let ty = self.ptr_ty();
        self.load(dst, mem, ty);
    }

    pub fn store_p(&mut self, src: Register, mem: MemOperand) {
        let ty = self.ptr_ty();
        self.store(src, mem, ty);
    }

    pub fn store_imm_p(&mut self, mem: MemOperand, imm: i64) {
        let mem = self.legalize(mem, NO_REG);
        let ty = self.ptr_ty();
        self.emit(Inst::StoreImm { mem, imm, ty });
    }

    /// Sign extending 32-bit load.
    pub fn load_w(&mut self, dst: Register, mem: MemOperand) {
        self.load(dst, mem, MemType::I32);
    }

    /// Zero extending 32-bit load.
    pub fn load_logical_w(&mut self, dst: Register, mem: MemOperand) {
        self.load(dst, mem, MemType::U32);
    }

    pub fn store_w(&mut self, src: Register, mem: MemOperand) {
        self.store(src, mem, MemType::U32);
    }

    pub fn load_logical_b(&mut self, dst: Register, mem: MemOperand) {
        self.load(dst, mem, MemType::U8);
    }

    pub fn store_b(&mut self, src: Register, mem: MemOperand) {
        self.store(src, mem, MemType::U8);
    }

    pub fn load_double(&mut self, dst: DoubleRegister, mem: MemOperand) {
        let mem = self.legalize(mem, NO_REG);
        self.emit(Inst::LoadD { dst, mem });
    }

    pub fn store_double(&mut self, src: DoubleRegister, mem: MemOperand) {
        let mem = self.legalize(mem, NO_REG);
        self.emit(Inst::StoreD { src, mem });
    }

    /// dst = effective address of mem. Leaves condition codes alone.
    pub fn lay(&mut self, dst: Register, mem: MemOperand) {
        let mem = self.legalize(mem, dst);
        self.emit(Inst::Lea { dst, mem });
    }

    // ==================== Stack ====================

    pub fn push(&mut self, src: Register) {
        let ptr = self.ptr();
        self.lay(regs::SP, MemOperand::new(regs::SP, -ptr));
        self.store_p(src, MemOperand::new(regs::SP, 0));
    }

    pub fn pop(&mut self, dst: Register) {
        let ptr = self.ptr();
        self.load_p(dst, MemOperand::new(regs::SP, 0));
        self.lay(regs::SP, MemOperand::new(regs::SP, ptr));
    }

    /// Push several registers; the first one ends up at the highest address.
    pub fn push_list(&mut self, srcs: &[Register]) {
        let ptr = self.ptr();
        let n = srcs.len() as i32;
        self.lay(regs::SP, MemOperand::new(regs::SP, -n * ptr));
        for (i, src) in srcs.iter().enumerate() {
            let slot = (n - 1 - i as i32) * ptr;
            self.store_p(*src, MemOperand::new(regs::SP, slot));
        }
    }

    /// Inverse of `push_list` with the same register order.
    pub fn pop_list(&mut self, dsts: &[Register]) {
        let ptr = self.ptr();
        let n = dsts.len() as i32;
        for (i, dst) in dsts.iter().enumerate().rev() {
            let slot = (n - 1 - i as i32) * ptr;
            self.load_p(*dst, MemOperand::new(regs::SP, slot));
        }
        self.lay(regs::SP, MemOperand::new(regs::SP, n * ptr));
    }

    /// Push a register list below `location`; the highest register code
    /// lands at the highest address.
    pub fn multi_push(&mut self, list: RegList, location: Register) {
        let ptr = self.ptr();
        let mut offset = list.count() as i32 * ptr;
        self.lay(location, MemOperand::new(location, -offset));
        for code in list.codes().rev() {
            offset -= ptr;
            self.store_p(Register::from_code(code), MemOperand::new(location, offset));
        }
    }

    pub fn multi_pop(&mut self, list: RegList, location: Register) {
        let ptr = self.ptr();
        let mut offset = 0;
        for code in list.codes() {
            self.load_p(Register::from_code(code), MemOperand::new(location, offset));
            offset += ptr;
        }
        self.lay(location, MemOperand::new(location, offset));
    }

    pub fn multi_push_doubles(&mut self, list: RegList, location: Register) {
        let mut offset = list.count() as i32 * WordWidth::DOUBLE_SIZE;
        self.lay(location, MemOperand::new(location, -offset));
        for code in list.codes().rev() {
            offset -= WordWidth::DOUBLE_SIZE;
            self.store_double(DoubleRegister::from_code(code), MemOperand::new(location, offset));
        }
    }

    pub fn multi_pop_doubles(&mut self, list: RegList, location: Register) {
        let mut offset = 0;
        for code in list.codes() {
            self.load_double(DoubleRegister::from_code(code), MemOperand::new(location, offset));
            offset += WordWidth::DOUBLE_SIZE;
        }
        self.lay(location, MemOperand::new(location, offset));
    }

    /// Drop `count` stack slots.
    pub fn drop_slots(&mut self, count: i32) {
        if count > 0 {
            let ptr = self.ptr();
            self.lay(regs::SP, MemOperand::new(regs::SP, count * ptr));
        }
    }

    // ==================== Control flow ====================

    pub fn b(&mut self, label: Label) {
        self.emit(Inst::Jump(Target::Label(label)));
    }

    pub fn branch(&mut self, cond: Cond, label: Label) {
        self.emit(Inst::Branch { cond, target: label });
    }

    pub fn jump(&mut self, target: Target) {
        self.emit(Inst::Jump(target));
    }

    pub fn call(&mut self, target: Target) {
        self.emit(Inst::Call(target));
    }

    pub fn call_stub(&mut self, stub: Stub) {
        self.trace(format_args!("call {}", stub));
        self.emit(Inst::Call(Target::Stub(stub)));
    }

    pub fn tail_call_stub(&mut self, stub: Stub) {
        self.emit(Inst::Jump(Target::Stub(stub)));
    }

    pub fn ret(&mut self) {
        self.emit(Inst::Ret);
    }

    /// Drop `count` slots and return.
    pub fn ret_drop(&mut self, count: i32) {
        self.drop_slots(count);
        self.ret();
    }

    // ==================== Smi checks ====================

    pub fn jump_if_smi(&mut self, value: Register, smi_label: Label) {
        self.test_if_smi(value);
        self.branch(Cond::Eq, smi_label);
    }

    pub fn jump_if_not_smi(&mut self, value: Register, not_smi_label: Label) {
        self.test_if_smi(value);
        self.branch(Cond::Ne, not_smi_label);
    }

    pub fn jump_if_not_both_smi(&mut self, reg1: Register, reg2: Register, on_not_both_smi: Label) {
        let op = self.op();
        self.alu(crate::asm::AluOp::Or, op, R0, reg1, reg2);
        self.jump_if_not_smi(R0, on_not_both_smi);
    }

    pub fn jump_if_either_smi(&mut self, reg1: Register, reg2: Register, on_either_smi: Label) {
        self.jump_if_smi(reg1, on_either_smi);
        self.jump_if_smi(reg2, on_either_smi);
    }

    /// Untag `src` into `dst` and jump if it was a Smi.
    pub fn untag_and_jump_if_smi(&mut self, dst: Register, src: Register, smi_case: Label) {
        self.test_if_smi(src);
        self.smi_untag(dst, src);
        self.branch(Cond::Eq, smi_case);
    }

    // ==================== Roots and types ====================

    fn root_mem(&self, index: RootIndex) -> MemOperand {
        MemOperand::new(regs::ROOTS, index.index() * self.ptr())
    }

    pub fn load_root(&mut self, dst: Register, index: RootIndex) {
        let mem = self.root_mem(index);
        self.load_p(dst, mem);
    }

    pub fn store_root(&mut self, src: Register, index: RootIndex) -> Result<(), EmitError> {
        if !index.can_be_written_after_initialization() {
            return Err(EmitError::Unsupported("store to a read-only root"));
        }
        let mem = self.root_mem(index);
        self.store_p(src, mem);
        Ok(())
    }

    /// Compare `obj` with a root; clobbers r0.
    pub fn compare_root(&mut self, obj: Register, index: RootIndex) {
        self.load_root(R0, index);
        let op = self.op();
        self.emit(Inst::Cmp { size: op, lhs: obj, rhs: Operand::Reg(R0) });
    }

    /// Load the map of `object` into `map` and compare its instance type.
    pub fn compare_object_type(&mut self, object: Register, map: Register, type_reg: Register, ty: u8) {
        let temp = if type_reg.is_valid() { type_reg } else { R0 };
        let map_offset = self.layout.map_offset();
        self.load_p(map, field_mem(object, map_offset));
        self.compare_instance_type(map, temp, ty);
    }

    pub fn compare_instance_type(&mut self, map: Register, type_reg: Register, ty: u8) {
        let offset = self.layout.map_instance_type_offset();
        self.load_logical_b(type_reg, field_mem(map, offset));
        let op = self.op();
        self.emit(Inst::Cmp { size: op, lhs: type_reg, rhs: Operand::Imm(ty as i64) });
    }

    /// Jump to `fail` unless the map of `obj` is the given root map.
    pub fn check_map(&mut self, obj: Register, scratch: Register, index: RootIndex, fail: Label, smi_check: bool) {
        if smi_check {
            self.jump_if_smi(obj, fail);
        }
        let map_offset = self.layout.map_offset();
        self.load_p(scratch, field_mem(obj, map_offset));
        self.compare_root(scratch, index);
        self.branch(Cond::Ne, fail);
    }

    pub fn jump_if_not_heap_number(
        &mut self,
        object: Register,
        heap_number_map: Register,
        scratch: Register,
        on_not_heap_number: Label,
    ) {
        let map_offset = self.layout.map_offset();
        self.load_p(scratch, field_mem(object, map_offset));
        self.assert_is_root(heap_number_map, RootIndex::HeapNumberMap);
        let op = self.op();
        self.emit(Inst::Cmp { size: op, lhs: scratch, rhs: Operand::Reg(heap_number_map) });
        self.branch(Cond::Ne, on_not_heap_number);
    }

    /// Walk `depth` links up the context chain starting at cp.
    pub fn load_context(&mut self, dst: Register, depth: u32) {
        if depth == 0 {
            self.mov(dst, regs::CP);
            return;
        }
        let previous = self.layout.context_slot_offset(HeapLayout::CONTEXT_PREVIOUS_INDEX);
        self.load_p(dst, MemOperand::new(regs::CP, previous));
        for _ in 1..depth {
            self.load_p(dst, MemOperand::new(dst, previous));
        }
    }

    // ==================== Counters ====================

    pub fn set_counter(&mut self, counter: Counter, value: i32, scratch1: Register, scratch2: Register) {
        if self.config.native_code_counters {
            self.load_imm(scratch1, value as i64);
            self.mov_external(scratch2, ExternalRef::Counter(counter));
            self.store_w(scratch1, MemOperand::new(scratch2, 0));
        }
    }

    pub fn increment_counter(&mut self, counter: Counter, value: i32, scratch1: Register, scratch2: Register) {
        self.adjust_counter(counter, value, scratch1, scratch2);
    }

    pub fn decrement_counter(&mut self, counter: Counter, value: i32, scratch1: Register, scratch2: Register) {
        self.adjust_counter(counter, -value, scratch1, scratch2);
    }

    fn adjust_counter(&mut self, counter: Counter, delta: i32, scratch1: Register, scratch2: Register) {
        if !self.config.native_code_counters {
            return;
        }
        self.mov_external(scratch1, ExternalRef::Counter(counter));
        self.load_w(scratch2, MemOperand::new(scratch1, 0));
        self.add_32(scratch2, scratch2, Operand::Imm(delta as i64));
        self.store_w(scratch2, MemOperand::new(scratch1, 0));
    }

    // ==================== Debug checks ====================

    /// Emit `check` only when debug code is enabled.
    pub fn assert(&mut self, cond: Cond, reason: AbortReason) {
        if self.emit_debug_code() {
            self.check(cond, reason);
        }
    }

    /// Abort unless `cond` holds.
    pub fn check(&mut self, cond: Cond, reason: AbortReason) {
        let ok = self.new_label();
        self.branch(cond, ok);
        self.abort(reason);
        self.bind(ok);
    }

    /// Call the abort runtime function with `reason`; never returns.
    pub fn abort(&mut self, reason: AbortReason) {
        self.stats.aborts += 1;
        self.comment(&format!("abort: {}", reason));
        if self.config.trap_on_abort {
            self.stop(reason.message());
            return;
        }
        self.load_smi_literal(R0, reason.code());
        self.push(R0);
        // Calls to abort are allowed without a frame.
        self.push_frame_scope();
        self.emit_runtime_call(RuntimeFunction::Abort, 1, SaveFpRegsMode::DontSave);
        self.pop_frame_scope();
    }

    pub fn assert_not_smi(&mut self, object: Register) {
        if self.emit_debug_code() {
            self.test_if_smi(object);
            self.check(Cond::Ne, AbortReason::OperandIsASmi);
        }
    }

    pub fn assert_smi(&mut self, object: Register) {
        if self.emit_debug_code() {
            self.test_if_smi(object);
            self.check(Cond::Eq, AbortReason::OperandIsNotSmi);
        }
    }

    pub fn assert_string(&mut self, object: Register) {
        if self.emit_debug_code() {
            self.test_if_smi(object);
            self.check(Cond::Ne, AbortReason::OperandIsASmiAndNotAString);
            self.push(object);
            self.compare_object_type(object, object, object, instance_type::FIRST_NONSTRING_TYPE);
            self.pop(object);
            self.check(Cond::Below, AbortReason::OperandIsNotAString);
        }
    }

    pub fn assert_function(&mut self, object: Register) {
        if self.emit_debug_code() {
            self.test_if_smi(object);
            self.check(Cond::Ne, AbortReason::OperandIsASmiAndNotAFunction);
            self.push(object);
            self.compare_object_type(object, object, object, instance_type::JS_FUNCTION_TYPE);
            self.pop(object);
            self.check(Cond::Eq, AbortReason::OperandIsNotAFunction);
        }
    }

    pub fn assert_undefined_or_allocation_site(&mut self, object: Register, scratch: Register) {
        if self.emit_debug_code() {
            let done_checking = self.new_label();
            self.assert_not_smi(object);
            self.compare_root(object, RootIndex::UndefinedValue);
            self.branch(Cond::Eq, done_checking);
            let map_offset = self.layout.map_offset();
            self.load_p(scratch, field_mem(object, map_offset));
            self.compare_root(scratch, RootIndex::AllocationSiteMap);
            self.assert(Cond::Eq, AbortReason::ExpectedUndefinedOrCell);
            self.bind(done_checking);
        }
    }

    pub fn assert_is_root(&mut self, reg: Register, index: RootIndex) {
        if self.emit_debug_code() {
            self.compare_root(reg, index);
            self.check(Cond::Eq, AbortReason::HeapNumberMapRegisterClobbered);
        }
    }

    // ==================== Misc helpers ====================

    /// Saturate a signed integer into 0..=255.
    pub fn clamp_uint8(&mut self, output: Register, input: Register) {
        let done = self.new_label();
        let negative = self.new_label();
        let overflow = self.new_label();
        let op = self.op();
        self.emit(Inst::Cmp { size: op, lhs: input, rhs: Operand::Imm(0) });
        self.branch(Cond::Lt, negative);
        self.emit(Inst::Cmp { size: op, lhs: input, rhs: Operand::Imm(255) });
        self.branch(Cond::Gt, overflow);
        self.mov(output, input);
        self.b(done);

        self.bind(negative);
        self.load_imm(output, 0);
        self.b(done);

        self.bind(overflow);
        self.load_imm(output, 255);
        self.bind(done);
    }

    /// Clamp a double into 0..=255, rounding to nearest even in range.
    /// NaN and values at or below zero give 0.
    pub fn clamp_double_to_uint8(&mut self, result: Register, input: DoubleRegister, double_scratch: DoubleRegister) {
        let above_zero = self.new_label();
        let done = self.new_label();
        let in_bounds = self.new_label();

        self.load_double_literal(double_scratch, 0.0, result);
        self.emit(Inst::FCmp { lhs: input, rhs: double_scratch });
        self.branch(Cond::Gt, above_zero);
        self.load_imm(result, 0);
        self.b(done);

        self.bind(above_zero);
        self.load_double_literal(double_scratch, 255.0, result);
        self.emit(Inst::FCmp { lhs: input, rhs: double_scratch });
        self.branch(Cond::Le, in_bounds);
        self.load_imm(result, 255);
        self.b(done);

        self.bind(in_bounds);
        self.emit(Inst::CvtFloatToInt {
            dst: result,
            src: input,
            to: IntKind::I32,
            mode: RoundingMode::ToNearestEven,
        });
        self.bind(done);
    }

    /// Copy `length` bytes from `src` to `dst`; all three are clobbered.
    pub fn copy_bytes(&mut self, src: Register, dst: Register, length: Register, scratch: Register) -> Result<(), EmitError> {
        if scratch == R0 {
            return Err(EmitError::InvalidRegister("copy_bytes scratch must not be r0"));
        }
        self.check_not_aliased("copy_bytes", &[src, dst, length, scratch])?;
        let done = self.new_label();
        let byte_loop = self.new_label();
        let op = self.op();
        self.emit(Inst::Cmp { size: op, lhs: length, rhs: Operand::Imm(0) });
        self.branch(Cond::Eq, done);
        self.bind(byte_loop);
        self.load_logical_b(scratch, MemOperand::new(src, 0));
        self.store_b(scratch, MemOperand::new(dst, 0));
        self.lay(src, MemOperand::new(src, 1));
        self.lay(dst, MemOperand::new(dst, 1));
        self.branch_on_count(length, byte_loop);
        self.bind(done);
        Ok(())
    }

    /// Store `filler` into every pointer slot in [current, end).
    /// Clobbers `current` and r1.
    pub fn initialize_fields_with_filler(&mut self, current: Register, end: Register, filler: Register) {
        let done = self.new_label();
        let fill_loop = self.new_label();
        let op = self.op();
        let ptr = self.ptr();
        let log2 = self.width().pointer_size_log2() as i64;
        self.alu(crate::asm::AluOp::Sub, op, R1, end, current);
        self.branch(Cond::Eq, done);
        self.alu(crate::asm::AluOp::Shr, op, R1, R1, log2);
        self.bind(fill_loop);
        self.store_p(filler, MemOperand::new(current, 0));
        self.lay(current, MemOperand::new(current, ptr));
        self.branch_on_count(R1, fill_loop);
        self.bind(done);
    }

    /// Turn a signalling NaN into a quiet one.
    pub fn canonicalize_nan(&mut self, dst: DoubleRegister, src: DoubleRegister) {
        self.move_double(dst, src);
        self.emit(Inst::LoadDImm { dst: regs::DOUBLE_REG_ZERO, bits: 0 });
        self.emit(Inst::FAlu { op: FAluOp::Sub, dst, lhs: dst, rhs: regs::DOUBLE_REG_ZERO });
    }

    /// Convert an untagged int32 to a double.
    pub fn convert_int_to_double(&mut self, src: Register, dst: DoubleRegister) {
        self.emit(Inst::CvtIntToFloat { dst, src, from: IntKind::I32, to: FloatKind::F64 });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::reg::{R2, R3, R4, R5, R6, R7};

    fn masm() -> MacroAssembler {
        MacroAssembler::new(EmitterConfig::default())
    }

    #[test]
    fn test_mov_to_self_is_elided() {
        let mut m = masm();
        m.mov(R2, R2);
        assert!(m.insts().is_empty());
        m.mov(R2, R3);
        assert_eq!(m.insts(), &[Inst::Mov { dst: R2, src: R3 }]);
    }

    #[test]
    fn test_large_displacement_uses_scratch() {
        let mut m = masm();
        m.load_p(R2, MemOperand::new(R3, 1 << 20));
        assert_eq!(m.insts()[0], Inst::LoadImm { dst: R1, imm: 1 << 20 });
        assert_eq!(
            m.insts()[1],
            Inst::Load { dst: R2, mem: MemOperand::indexed(R3, R1, 0), ty: MemType::U64 }
        );
    }

    #[test]
    fn test_large_displacement_avoids_r1_base() {
        let mut m = masm();
        m.store_p(R2, MemOperand::new(R1, -(1 << 20)));
        assert_eq!(m.insts()[0], Inst::LoadImm { dst: regs::IP, imm: -(1 << 20) });
    }

    #[test]
    fn test_multi_push_order() {
        let mut m = masm();
        m.multi_push(RegList::of(&[R4, R2, R7]), regs::SP);
        let stores: Vec<(Register, i32)> = m
            .insts()
            .iter()
            .filter_map(|i| match i {
                Inst::Store { src, mem, .. } => Some((*src, mem.offset())),
                _ => None,
            })
            .collect();
        assert_eq!(stores, vec![(R7, 16), (R4, 8), (R2, 0)]);
    }

    #[test]
    fn test_counters_disabled() {
        let config = EmitterConfig { native_code_counters: false, ..EmitterConfig::default() };
        let mut m = MacroAssembler::new(config);
        m.increment_counter(Counter::Slot(0), 1, R5, R6);
        assert!(m.insts().is_empty());
    }

    #[test]
    fn test_assert_only_in_debug_code() {
        let mut m = masm();
        m.assert(Cond::Eq, AbortReason::OperandIsNotSmi);
        assert!(m.insts().is_empty());

        let mut m = MacroAssembler::new(EmitterConfig::default().with_debug_code(true));
        m.assert(Cond::Eq, AbortReason::OperandIsNotSmi);
        assert!(m.insts().iter().any(|i| matches!(i, Inst::Call(Target::Stub(Stub::CEntry { .. })))));
        assert!(!m.has_frame());
    }

    #[test]
    fn test_trap_on_abort_emits_stop() {
        let config = EmitterConfig { trap_on_abort: true, ..EmitterConfig::default() };
        let mut m = MacroAssembler::new(config);
        m.abort(AbortReason::IndexIsNegative);
        assert!(m.insts().iter().any(|i| matches!(i, Inst::Stop(_))));
        assert_eq!(m.stats().aborts, 1);
    }

    #[test]
    fn test_finish_reports_unbound_label() {
        let mut m = masm();
        let l = m.new_label();
        m.b(l);
        assert_eq!(m.finish().unwrap_err(), EmitError::UnboundLabel(l.id()));
    }

    #[test]
    fn test_finish_with_trace_returns_code() {
        let mut m = MacroAssembler::new(EmitterConfig { trace: true, ..EmitterConfig::default() });
        let l = m.new_label();
        m.b(l);
        m.bind(l);
        m.ret();
        let code = m.finish().unwrap();
        assert_eq!(code.len(), 2);
        assert_eq!(code.label_pc(l), Some(1));
    }

    #[test]
    fn test_store_root_rejects_read_only_root() {
        let mut m = masm();
        assert!(m.store_root(R2, RootIndex::UndefinedValue).is_err());
        assert!(m.store_root(R2, RootIndex::EmptyString).is_ok());
    }

    #[test]
    fn test_copy_bytes_rejects_r0_scratch() {
        let mut m = masm();
        assert!(m.copy_bytes(R2, R3, R4, R0).is_err());
        assert!(m.copy_bytes(R2, R3, R4, R4).is_err());
    }
}
