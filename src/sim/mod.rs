//! Simulator for emitted instruction streams.
//!
//! Runs a finished `Code` over sparse memory laid out like a tiny isolate:
//! allocation top/limit cells, a roots table, paged new and old spaces with
//! page headers and mark bitmaps, statistics counters and a stack. Stubs
//! and runtime functions are handled natively and every call into them is
//! recorded, so tests can observe what the emitted code decided to do.
//!
//! Code addresses are `CODE_BASE + 4 * pc`; returning to `RETURN_SENTINEL`
//! ends the run.

pub mod harness;
pub mod heap;
pub mod memory;

use std::collections::HashMap;

pub use harness::{RunError, RunReport, run_program, run_scenario};
pub use heap::Space;
pub use memory::Memory;

use crate::asm::reg::{R2, R3, R4};
use crate::asm::{
    AluOp, Code, Cond, DoubleRegister, FAluOp, FloatKind, Inst, IntKind, Label, MemOperand,
    MemType, OpSize, Operand, Register, RoundingMode, Stub, Target, UnaryOp, WordWidth, regs,
};
use crate::config::EmitterConfig;
use crate::error::SimError;
use crate::layout::{
    AbortReason, Counter, ExternalRef, HEAP_OBJECT_TAG, HeapLayout, RememberedSetAction, RootIndex,
    RuntimeFunction,
};

/// Address map of the simulated process.
pub mod addr {
    pub const ISOLATE: u64 = 0x1000;
    pub const COUNTERS: u64 = 0x1100;
    pub const ROOTS: u64 = 0x2000;
    pub const CODE_OBJECT: u64 = 0x3000;
    pub const STORE_BUFFER: u64 = 0x4_0000;
    pub const STACK_TOP: u64 = 0x10_0000;
    pub const NEW_SPACE: u64 = 0x1000_0000;
    pub const NEW_SPACE_SIZE: u64 = 0x100_0000;
    pub const OLD_SPACE: u64 = 0x2000_0000;
    pub const CODE_BASE: u64 = 0x4000_0000;
    pub const C_FUNCTIONS: u64 = 0xE000_0000;
    pub const RUNTIME: u64 = 0xF000_0000;
    /// Initial link register; returning here ends the run.
    pub const RETURN_SENTINEL: u64 = 0x0BAD_0000;

    // Cells inside the isolate block.
    pub(crate) const OLD_TOP_OFFSET: u64 = 0x20;
    pub(crate) const C_ENTRY_FP_OFFSET: u64 = 0x40;
    pub(crate) const CONTEXT_OFFSET: u64 = 0x48;
    pub(crate) const STORE_BUFFER_TOP_OFFSET: u64 = 0x50;
}

pub const DEFAULT_STEP_LIMIT: u64 = 1_000_000;

/// A native routine registered as a C function.
pub type NativeFunction = Box<dyn FnMut(&[u64; 5]) -> u64>;

/// A call out of the emitted code, in execution order.
#[derive(Debug, Clone, PartialEq)]
pub enum StubCall {
    RecordWrite {
        object: u64,
        address: u64,
        /// Value read from the slot when the stub was entered
        value: u64,
        remembered_set_action: RememberedSetAction,
    },
    StoreBufferOverflow,
    Runtime { function: RuntimeFunction, argc: u64 },
    CFunction { id: u32, args: [u64; 5] },
    ArgumentsAdaptor { expected: i64, actual: i64, function: u64 },
    DoubleToI { value: f64, result: i32 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Flags {
    eq: bool,
    lt: bool,
    below: bool,
    overflow: bool,
    unordered: bool,
}

impl Flags {
    fn holds(self, cond: Cond) -> bool {
        let ordered = !self.unordered;
        match cond {
            Cond::Eq => self.eq && ordered,
            Cond::Ne => !self.eq || self.unordered,
            Cond::Lt => self.lt && ordered,
            Cond::Ge => !self.lt && ordered,
            Cond::Le => (self.lt || self.eq) && ordered,
            Cond::Gt => !self.lt && !self.eq && ordered,
            Cond::Below => self.below,
            Cond::AboveEqual => !self.below,
            Cond::BelowEqual => self.below || self.eq,
            Cond::Above => !self.below && !self.eq,
            Cond::Overflow => self.overflow,
            Cond::NoOverflow => !self.overflow,
            Cond::Unordered => self.unordered,
            Cond::Ordered => ordered,
        }
    }

    fn from_int(size: OpSize, result: u64, overflow: bool) -> Self {
        Flags {
            eq: size.truncate(result) == 0,
            lt: size.signed(result) < 0,
            below: false,
            overflow,
            unordered: false,
        }
    }
}

/// JavaScript ToInt32: truncate, then wrap modulo 2^32.
pub fn double_to_int32(value: f64) -> i32 {
    if !value.is_finite() {
        return 0;
    }
    let truncated = value.trunc();
    let modulo = truncated.rem_euclid(4_294_967_296.0);
    modulo as u64 as u32 as i32
}

fn round(value: f64, mode: RoundingMode) -> f64 {
    match mode {
        RoundingMode::ToZero => value.trunc(),
        RoundingMode::ToNearestEven => value.round_ties_even(),
        RoundingMode::ToPlusInf => value.ceil(),
        RoundingMode::ToMinusInf => value.floor(),
    }
}

/// Convert an already rounded double; `None` when it does not fit.
fn float_to_int(value: f64, to: IntKind) -> Option<u64> {
    const TWO_31: f64 = 2_147_483_648.0;
    const TWO_32: f64 = 4_294_967_296.0;
    const TWO_63: f64 = 9_223_372_036_854_775_808.0;
    const TWO_64: f64 = 18_446_744_073_709_551_616.0;
    if value.is_nan() {
        return None;
    }
    match to {
        IntKind::I32 if (-TWO_31..TWO_31).contains(&value) => Some(value as i32 as i64 as u64),
        IntKind::U32 if (0.0..TWO_32).contains(&value) => Some(value as u32 as u64),
        IntKind::I64 if (-TWO_63..TWO_63).contains(&value) => Some(value as i64 as u64),
        IntKind::U64 if (0.0..TWO_64).contains(&value) => Some(value as u64),
        _ => None,
    }
}

fn overflows(op: AluOp, size: OpSize, a: i64, b: i64) -> bool {
    match (size, op) {
        (OpSize::S32, AluOp::Add) => (a as i32).checked_add(b as i32).is_none(),
        (OpSize::S32, AluOp::Sub) => (a as i32).checked_sub(b as i32).is_none(),
        (OpSize::S32, AluOp::Mul) => (a as i32).checked_mul(b as i32).is_none(),
        (OpSize::S64, AluOp::Add) => a.checked_add(b).is_none(),
        (OpSize::S64, AluOp::Sub) => a.checked_sub(b).is_none(),
        (OpSize::S64, AluOp::Mul) => a.checked_mul(b).is_none(),
        _ => false,
    }
}

pub struct Simulator {
    code: Code,
    width: WordWidth,
    layout: HeapLayout,
    memory: Memory,
    regs: [u64; Register::NUM_REGISTERS],
    dregs: [u64; DoubleRegister::NUM_REGISTERS],
    flags: Flags,
    pc: usize,
    halted: bool,
    steps: u64,
    step_limit: u64,
    trace: bool,
    calls: Vec<StubCall>,
    natives: HashMap<u32, NativeFunction>,
}

impl Simulator {
    /// Load `code` into a fresh process image. The page flags follow the
    /// marking state named by `config`.
    pub fn new(code: Code, config: &EmitterConfig) -> Self {
        let width = code.width();
        let mut sim = Self {
            code,
            width,
            layout: HeapLayout::new(width),
            memory: Memory::new(),
            regs: [0; Register::NUM_REGISTERS],
            dregs: [0; DoubleRegister::NUM_REGISTERS],
            flags: Flags::default(),
            pc: 0,
            halted: false,
            steps: 0,
            step_limit: DEFAULT_STEP_LIMIT,
            trace: config.trace,
            calls: Vec::new(),
            natives: HashMap::new(),
        };
        sim.init_heap(config.incremental_marking);
        sim.regs[regs::SP.code() as usize] = addr::STACK_TOP;
        sim.regs[regs::ROOTS.code() as usize] = addr::ROOTS;
        sim.regs[regs::CP.code() as usize] = sim.root(RootIndex::UndefinedValue);
        sim
    }

    pub fn with_step_limit(mut self, limit: u64) -> Self {
        self.step_limit = limit;
        self
    }

    pub fn width(&self) -> WordWidth {
        self.width
    }

    pub fn layout(&self) -> &HeapLayout {
        &self.layout
    }

    pub fn code(&self) -> &Code {
        &self.code
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn calls(&self) -> &[StubCall] {
        &self.calls
    }

    pub fn count_calls(&self, pred: impl Fn(&StubCall) -> bool) -> usize {
        self.calls.iter().filter(|c| pred(c)).count()
    }

    pub fn record_write_calls(&self) -> usize {
        self.count_calls(|c| matches!(c, StubCall::RecordWrite { .. }))
    }

    pub fn adaptor_calls(&self) -> usize {
        self.count_calls(|c| matches!(c, StubCall::ArgumentsAdaptor { .. }))
    }

    /// Register a native routine callable as `ExternalRef::CFunction(id)`.
    pub fn register_c_function(&mut self, id: u32, f: impl FnMut(&[u64; 5]) -> u64 + 'static) {
        self.natives.insert(id, Box::new(f));
    }

    // ==================== Registers ====================

    pub fn reg(&self, reg: Register) -> u64 {
        self.regs[reg.code() as usize]
    }

    /// Signed value of a register at pointer width.
    pub fn reg_signed(&self, reg: Register) -> i64 {
        self.width.op_size().signed(self.reg(reg))
    }

    /// Low 32 bits of a register as a signed integer.
    pub fn reg_i32(&self, reg: Register) -> i32 {
        self.reg(reg) as u32 as i32
    }

    pub fn set_reg(&mut self, reg: Register, value: u64) {
        self.regs[reg.code() as usize] = value;
    }

    pub fn dreg(&self, reg: DoubleRegister) -> f64 {
        f64::from_bits(self.dregs[reg.code() as usize])
    }

    pub fn dreg_bits(&self, reg: DoubleRegister) -> u64 {
        self.dregs[reg.code() as usize]
    }

    pub fn set_dreg(&mut self, reg: DoubleRegister, value: f64) {
        self.dregs[reg.code() as usize] = value.to_bits();
    }

    pub fn sp(&self) -> u64 {
        self.reg(regs::SP)
    }

    pub fn fp(&self) -> u64 {
        self.reg(regs::FP)
    }

    // ==================== Isolate cells ====================

    fn ptr(&self) -> u64 {
        self.width.pointer_size() as u64
    }

    pub fn read_ptr(&self, address: u64) -> u64 {
        self.memory.read(address, self.ptr() as usize)
    }

    pub fn write_ptr(&mut self, address: u64, value: u64) {
        let size = self.ptr() as usize;
        self.memory.write(address, size, value);
    }

    /// Address (or value, for masks and start addresses) of an external
    /// reference.
    pub fn external(&self, ext: ExternalRef) -> u64 {
        let ptr = self.ptr();
        match ext {
            ExternalRef::NewSpaceAllocationTop => addr::ISOLATE,
            ExternalRef::NewSpaceAllocationLimit => addr::ISOLATE + ptr,
            ExternalRef::OldSpaceAllocationTop => addr::ISOLATE + addr::OLD_TOP_OFFSET,
            ExternalRef::OldSpaceAllocationLimit => addr::ISOLATE + addr::OLD_TOP_OFFSET + ptr,
            ExternalRef::CEntryFp => addr::ISOLATE + addr::C_ENTRY_FP_OFFSET,
            ExternalRef::Context => addr::ISOLATE + addr::CONTEXT_OFFSET,
            ExternalRef::StoreBufferTop => addr::ISOLATE + addr::STORE_BUFFER_TOP_OFFSET,
            ExternalRef::NewSpaceStart => addr::NEW_SPACE,
            ExternalRef::NewSpaceMask => self.width.op_size().truncate(!(addr::NEW_SPACE_SIZE - 1)),
            ExternalRef::CodeObject => addr::CODE_OBJECT + HEAP_OBJECT_TAG as u64,
            ExternalRef::Counter(c) => addr::COUNTERS + c.slot() as u64 * 4,
            ExternalRef::Runtime(f) => addr::RUNTIME + f.id() as u64 * 16,
            ExternalRef::CFunction(id) => addr::C_FUNCTIONS + id as u64 * 16,
        }
    }

    pub fn counter(&self, counter: Counter) -> i32 {
        self.memory.read_u32(self.external(ExternalRef::Counter(counter))) as i32
    }

    pub fn c_entry_fp(&self) -> u64 {
        self.read_ptr(self.external(ExternalRef::CEntryFp))
    }

    pub fn saved_context(&self) -> u64 {
        self.read_ptr(self.external(ExternalRef::Context))
    }

    /// Code address of a bound label.
    pub fn code_address(&self, label: Label) -> Option<u64> {
        self.code.label_pc(label).map(|pc| addr::CODE_BASE + 4 * pc as u64)
    }

    fn code_pc(&self, address: u64) -> Option<usize> {
        let offset = address.checked_sub(addr::CODE_BASE)?;
        let pc = (offset / 4) as usize;
        (offset % 4 == 0 && pc <= self.code.len()).then_some(pc)
    }

    // ==================== Execution ====================

    /// Run from the first instruction until the code returns to the
    /// sentinel or falls off its end.
    pub fn run(&mut self) -> Result<(), SimError> {
        self.run_at(0)
    }

    /// Run from a label, as if called.
    pub fn run_from(&mut self, label: Label) -> Result<(), SimError> {
        let pc = self.code.label_pc(label).ok_or(SimError::UnboundLabel(label.id()))?;
        self.run_at(pc)
    }

    fn run_at(&mut self, pc: usize) -> Result<(), SimError> {
        self.pc = pc;
        self.halted = false;
        self.regs[regs::LR.code() as usize] = addr::RETURN_SENTINEL;
        while !self.halted && self.pc < self.code.len() {
            if self.steps >= self.step_limit {
                return Err(SimError::StepLimit(self.step_limit));
            }
            self.steps += 1;
            let inst = self.code.insts()[self.pc].clone();
            self.pc += 1;
            self.execute(&inst)?;
        }
        Ok(())
    }

    fn operand(&self, op: Operand) -> u64 {
        match op {
            Operand::Reg(r) => self.reg(r),
            Operand::Imm(v) => v as u64,
        }
    }

    fn effective_address(&self, mem: MemOperand) -> u64 {
        let mut address = self.reg(mem.base()).wrapping_add(mem.offset() as i64 as u64);
        if mem.index().is_valid() {
            address = address.wrapping_add(self.reg(mem.index()));
        }
        self.width.op_size().truncate(address)
    }

    fn label_pc(&self, label: Label) -> Result<usize, SimError> {
        self.code.label_pc(label).ok_or(SimError::UnboundLabel(label.id()))
    }

    fn execute(&mut self, inst: &Inst) -> Result<(), SimError> {
        match *inst {
            Inst::Mov { dst, src } => self.set_reg(dst, self.reg(src)),
            Inst::LoadImm { dst, imm } => self.set_reg(dst, imm as u64),
            Inst::LoadExternal { dst, ext } => self.set_reg(dst, self.external(ext)),
            Inst::Load { dst, mem, ty } => {
                let address = self.effective_address(mem);
                self.set_reg(dst, self.memory.load(address, ty));
            }
            Inst::Store { src, mem, ty } => {
                let address = self.effective_address(mem);
                self.memory.store(address, ty, self.reg(src));
            }
            Inst::StoreImm { mem, imm, ty } => {
                let address = self.effective_address(mem);
                self.memory.store(address, ty, imm as u64);
            }
            Inst::Lea { dst, mem } => self.set_reg(dst, self.effective_address(mem)),
            Inst::Extend { dst, src, ty } => {
                let v = self.reg(src);
                let extended = match ty {
                    MemType::U8 => v as u8 as u64,
                    MemType::I8 => v as u8 as i8 as i64 as u64,
                    MemType::U16 => v as u16 as u64,
                    MemType::I16 => v as u16 as i16 as i64 as u64,
                    MemType::U32 => v as u32 as u64,
                    MemType::I32 => v as u32 as i32 as i64 as u64,
                    MemType::U64 => v,
                };
                self.set_reg(dst, extended);
            }
            Inst::Alu { op, size, dst, lhs, rhs } => {
                let result = self.alu(op, size, self.reg(lhs), self.operand(rhs))?;
                self.set_reg(dst, result);
            }
            Inst::Unary { op, size, dst, src } => {
                let v = self.reg(src);
                let (result, overflow) = match op {
                    UnaryOp::Neg => {
                        let s = size.signed(v);
                        (0i64.wrapping_sub(s) as u64, overflows(AluOp::Sub, size, 0, s))
                    }
                    UnaryOp::Not => (!v, false),
                };
                let result = size.truncate(result);
                self.flags = Flags::from_int(size, result, overflow);
                self.set_reg(dst, result);
            }
            Inst::Cmp { size, lhs, rhs } => {
                let (a, b) = (self.reg(lhs), self.operand(rhs));
                self.flags = Flags {
                    eq: size.truncate(a) == size.truncate(b),
                    lt: size.signed(a) < size.signed(b),
                    below: size.truncate(a) < size.truncate(b),
                    overflow: false,
                    unordered: false,
                };
            }
            Inst::Test { size, lhs, rhs } => {
                let result = size.truncate(self.reg(lhs) & self.operand(rhs));
                self.flags = Flags::from_int(size, result, false);
            }
            Inst::MovD { dst, src } => self.dregs[dst.code() as usize] = self.dreg_bits(src),
            Inst::LoadD { dst, mem } => {
                let address = self.effective_address(mem);
                self.dregs[dst.code() as usize] = self.memory.read_u64(address);
            }
            Inst::StoreD { src, mem } => {
                let address = self.effective_address(mem);
                self.memory.write_u64(address, self.dreg_bits(src));
            }
            Inst::LoadDImm { dst, bits } => self.dregs[dst.code() as usize] = bits,
            Inst::FAlu { op, dst, lhs, rhs } => {
                let (a, b) = (self.dreg(lhs), self.dreg(rhs));
                let result = match op {
                    FAluOp::Add => a + b,
                    FAluOp::Sub => a - b,
                    FAluOp::Mul => a * b,
                    FAluOp::Div => a / b,
                };
                self.set_dreg(dst, result);
            }
            Inst::FCmp { lhs, rhs } => {
                let (a, b) = (self.dreg(lhs), self.dreg(rhs));
                self.flags = Flags {
                    eq: a == b,
                    lt: a < b,
                    below: a < b,
                    overflow: false,
                    unordered: a.is_nan() || b.is_nan(),
                };
            }
            Inst::CvtIntToFloat { dst, src, from, to } => {
                let v = self.reg(src);
                let value = match from {
                    IntKind::I32 => v as u32 as i32 as f64,
                    IntKind::U32 => v as u32 as f64,
                    IntKind::I64 => v as i64 as f64,
                    IntKind::U64 => v as f64,
                };
                let value = match to {
                    FloatKind::F32 => value as f32 as f64,
                    FloatKind::F64 => value,
                };
                self.set_dreg(dst, value);
            }
            Inst::CvtFloatToInt { dst, src, to, mode } => {
                let rounded = round(self.dreg(src), mode);
                let (result, overflow) = match float_to_int(rounded, to) {
                    Some(v) => (v, false),
                    None => match to {
                        IntKind::I32 => (i32::MIN as i64 as u64, true),
                        IntKind::I64 => (i64::MIN as u64, true),
                        IntKind::U32 | IntKind::U64 => (0, true),
                    },
                };
                self.flags = Flags::from_int(OpSize::S64, result, overflow);
                self.set_reg(dst, result);
            }
            Inst::RoundD { dst, src, mode } => {
                let value = round(self.dreg(src), mode);
                self.set_dreg(dst, value);
            }
            Inst::MovDToGpr { dst, src } => self.set_reg(dst, self.dreg_bits(src)),
            Inst::MovGprToD { dst, src } => self.dregs[dst.code() as usize] = self.reg(src),
            Inst::Jump(target) => self.jump(target)?,
            Inst::Branch { cond, target } => {
                if self.flags.holds(cond) {
                    self.pc = self.label_pc(target)?;
                }
            }
            Inst::Call(target) => self.call(target)?,
            Inst::Ret => self.return_to(self.reg(regs::LR))?,
            Inst::Stop(ref msg) => return Err(SimError::Stop(msg.clone())),
            Inst::Comment(_) | Inst::Nop => {}
        }
        Ok(())
    }

    fn alu(&mut self, op: AluOp, size: OpSize, a: u64, b: u64) -> Result<u64, SimError> {
        let (sa, sb) = (size.signed(a), size.signed(b));
        let amount = (b & 63) as u32;
        let result = match op {
            AluOp::Add => sa.wrapping_add(sb) as u64,
            AluOp::Sub => sa.wrapping_sub(sb) as u64,
            AluOp::Mul => sa.wrapping_mul(sb) as u64,
            AluOp::Div => {
                if sb == 0 {
                    return Err(SimError::DivisionByZero);
                }
                sa.wrapping_div(sb) as u64
            }
            AluOp::And => a & b,
            AluOp::Or => a | b,
            AluOp::Xor => a ^ b,
            AluOp::Shl => match size {
                OpSize::S32 => (a as u32).checked_shl(amount).unwrap_or(0) as u64,
                OpSize::S64 => a.checked_shl(amount).unwrap_or(0),
            },
            AluOp::Shr => match size {
                OpSize::S32 => (a as u32).checked_shr(amount).unwrap_or(0) as u64,
                OpSize::S64 => a.checked_shr(amount).unwrap_or(0),
            },
            AluOp::Sar => match size {
                OpSize::S32 => ((a as u32 as i32) >> amount.min(31)) as i64 as u64,
                OpSize::S64 => ((a as i64) >> amount) as u64,
            },
        };
        let result = size.truncate(result);
        let mut flags = Flags::from_int(size, result, overflows(op, size, sa, sb));
        if op == AluOp::Sub {
            flags.below = size.truncate(a) < size.truncate(b);
        }
        self.flags = flags;
        Ok(result)
    }

    fn return_address(&self) -> u64 {
        addr::CODE_BASE + 4 * self.pc as u64
    }

    fn return_to(&mut self, address: u64) -> Result<(), SimError> {
        let address = self.width.op_size().truncate(address);
        if address == addr::RETURN_SENTINEL {
            self.halted = true;
            return Ok(());
        }
        self.pc = self.code_pc(address).ok_or(SimError::InvalidCallTarget(address))?;
        Ok(())
    }

    fn jump(&mut self, target: Target) -> Result<(), SimError> {
        match target {
            Target::Label(label) => self.pc = self.label_pc(label)?,
            Target::Reg(reg) => {
                let address = self.width.op_size().truncate(self.reg(reg));
                if self.is_native(address) {
                    self.call_native(address)?;
                    self.return_to(self.reg(regs::LR))?;
                } else {
                    self.pc = self.code_pc(address).ok_or(SimError::InvalidCallTarget(address))?;
                }
            }
            Target::Stub(Stub::ArgumentsAdaptor) => self.arguments_adaptor()?,
            Target::Stub(stub) => {
                self.run_stub(stub)?;
                self.return_to(self.reg(regs::LR))?;
            }
        }
        Ok(())
    }

    fn call(&mut self, target: Target) -> Result<(), SimError> {
        let return_address = self.return_address();
        self.set_reg(regs::LR, return_address);
        match target {
            Target::Label(label) => self.pc = self.label_pc(label)?,
            Target::Reg(reg) => {
                let address = self.width.op_size().truncate(self.reg(reg));
                if self.is_native(address) {
                    self.call_native(address)?;
                } else {
                    self.pc = self.code_pc(address).ok_or(SimError::InvalidCallTarget(address))?;
                }
            }
            Target::Stub(Stub::ArgumentsAdaptor) => self.arguments_adaptor()?,
            Target::Stub(stub) => self.run_stub(stub)?,
        }
        Ok(())
    }

    fn trace_call(&self, call: &StubCall) {
        if self.trace {
            eprintln!("[sim] {:?}", call);
        }
    }

    fn record(&mut self, call: StubCall) {
        self.trace_call(&call);
        self.calls.push(call);
    }

    // ==================== Out-of-line code ====================

    fn is_native(&self, address: u64) -> bool {
        address >= addr::C_FUNCTIONS
    }

    /// A direct call to a C function or runtime entry: arguments in r2-r6,
    /// result in r2.
    fn call_native(&mut self, address: u64) -> Result<(), SimError> {
        if address >= addr::RUNTIME {
            return Err(SimError::Native {
                name: format!("{:#x}", address),
                message: "runtime functions are entered through CEntry".to_string(),
            });
        }
        let offset = address - addr::C_FUNCTIONS;
        if offset % 16 != 0 {
            return Err(SimError::InvalidCallTarget(address));
        }
        let id = (offset / 16) as u32;
        let args = [
            self.reg(regs::ARGS[0]),
            self.reg(regs::ARGS[1]),
            self.reg(regs::ARGS[2]),
            self.reg(regs::ARGS[3]),
            self.reg(regs::ARGS[4]),
        ];
        self.record(StubCall::CFunction { id, args });
        let f = self.natives.get_mut(&id).ok_or(SimError::InvalidCallTarget(address))?;
        let result = f(&args);
        self.set_reg(regs::RETURN, result);
        Ok(())
    }

    fn run_stub(&mut self, stub: Stub) -> Result<(), SimError> {
        match stub {
            Stub::RecordWrite { object, address, remembered_set_action, .. } => {
                let address = self.reg(address);
                let value = self.read_ptr(address);
                let call = StubCall::RecordWrite {
                    object: self.reg(object),
                    address,
                    value,
                    remembered_set_action,
                };
                self.record(call);
                if remembered_set_action == RememberedSetAction::Emit && self.in_new_space(value) {
                    self.append_to_store_buffer(address);
                }
            }
            Stub::StoreBufferOverflow { .. } => {
                self.record(StubCall::StoreBufferOverflow);
                let top = self.external(ExternalRef::StoreBufferTop);
                self.write_ptr(top, addr::STORE_BUFFER);
            }
            Stub::CEntry { .. } => self.c_entry()?,
            Stub::DoubleToI { source, result, offset } => {
                let address = self.width.op_size().truncate(self.reg(source).wrapping_add(offset as i64 as u64));
                let value = self.memory.read_f64(address);
                let truncated = double_to_int32(value);
                self.record(StubCall::DoubleToI { value, result: truncated });
                self.set_reg(result, self.width.op_size().truncate(truncated as i64 as u64));
            }
            Stub::ArgumentsAdaptor => self.arguments_adaptor()?,
        }
        Ok(())
    }

    /// Set actual = expected and enter the code of the function in r3. The
    /// callee returns straight to whoever called the adaptor.
    fn arguments_adaptor(&mut self) -> Result<(), SimError> {
        let op = self.width.op_size();
        let expected = op.signed(self.reg(R4));
        let actual = op.signed(self.reg(R2));
        let function = self.reg(R3);
        self.record(StubCall::ArgumentsAdaptor { expected, actual, function });
        self.set_reg(R2, self.reg(R4));
        let code_entry_offset = self.layout.js_function_code_entry_offset();
        let entry = self.read_field(function, code_entry_offset);
        self.pc = self.code_pc(entry).ok_or(SimError::InvalidCallTarget(entry))?;
        Ok(())
    }

    /// Runtime entry: r2 holds the argument count, r3 the target, the
    /// arguments are on the stack with the first one at the highest address.
    /// The arguments are dropped on return.
    fn c_entry(&mut self) -> Result<(), SimError> {
        let argc = self.reg(R2);
        let target = self.width.op_size().truncate(self.reg(R3));
        if target < addr::RUNTIME {
            if self.is_native(target) {
                self.call_native(target)?;
                return Ok(());
            }
            return Err(SimError::InvalidCallTarget(target));
        }
        let offset = target - addr::RUNTIME;
        let function = RuntimeFunction::ALL
            .iter()
            .copied()
            .find(|f| offset % 16 == 0 && f.id() as u64 == offset / 16)
            .ok_or(SimError::UnknownRuntimeFunction(target))?;
        self.record(StubCall::Runtime { function, argc });

        let sp = self.sp();
        let ptr = self.ptr();
        let arg = |sim: &Self, i: u64| sim.read_ptr(sp + (argc - 1 - i) * ptr);
        let result = match function {
            RuntimeFunction::Abort => {
                let code = self.width.smi_value(arg(self, 0));
                return Err(match AbortReason::from_code(code) {
                    Some(reason) => SimError::Abort(reason),
                    None => SimError::UnknownAbort(code),
                });
            }
            RuntimeFunction::AllocateInNewSpace | RuntimeFunction::AllocateInTargetSpace => {
                let size = self.width.smi_value(arg(self, 0));
                self.allocate_raw(Space::Old, size as u64)? + HEAP_OBJECT_TAG as u64
            }
            RuntimeFunction::StackGuard => self.root(RootIndex::UndefinedValue),
            RuntimeFunction::NumberToString => self.root(RootIndex::EmptyString),
        };
        self.set_reg(regs::RETURN, result);
        self.set_reg(regs::SP, sp + argc * ptr);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::CodeBuffer;
    use crate::asm::reg::{D1, R5};

    fn run(insts: Vec<Inst>) -> Simulator {
        let mut buf = CodeBuffer::new();
        for inst in insts {
            buf.emit(inst);
        }
        let code = buf.finalize(WordWidth::W64).unwrap();
        let mut sim = Simulator::new(code, &EmitterConfig::default());
        sim.run().unwrap();
        sim
    }

    #[test]
    fn test_alu_flags() {
        let sim = run(vec![
            Inst::LoadImm { dst: R2, imm: i64::MAX },
            Inst::Alu { op: AluOp::Add, size: OpSize::S64, dst: R3, lhs: R2, rhs: Operand::Imm(1) },
        ]);
        assert_eq!(sim.reg(R3), i64::MIN as u64);
        assert!(sim.flags.holds(Cond::Overflow));
        assert!(sim.flags.holds(Cond::Lt));
    }

    #[test]
    fn test_32bit_ops_zero_extend() {
        let sim = run(vec![
            Inst::LoadImm { dst: R2, imm: 0 },
            Inst::Alu { op: AluOp::Sub, size: OpSize::S32, dst: R3, lhs: R2, rhs: Operand::Imm(1) },
        ]);
        assert_eq!(sim.reg(R3), 0xFFFF_FFFF);
        assert_eq!(sim.reg_i32(R3), -1);
        assert!(sim.flags.holds(Cond::Below));
    }

    #[test]
    fn test_cmp_signed_and_unsigned() {
        let sim = run(vec![
            Inst::LoadImm { dst: R2, imm: -1 },
            Inst::Cmp { size: OpSize::S64, lhs: R2, rhs: Operand::Imm(1) },
        ]);
        assert!(sim.flags.holds(Cond::Lt));
        assert!(sim.flags.holds(Cond::Above));
    }

    #[test]
    fn test_nan_compares_unordered() {
        let sim = run(vec![
            Inst::LoadDImm { dst: D1, bits: f64::NAN.to_bits() },
            Inst::FCmp { lhs: D1, rhs: D1 },
        ]);
        assert!(sim.flags.holds(Cond::Unordered));
        assert!(sim.flags.holds(Cond::Ne));
        assert!(!sim.flags.holds(Cond::Le));
    }

    #[test]
    fn test_float_to_int_overflow() {
        let sim = run(vec![
            Inst::LoadDImm { dst: D1, bits: 2_147_483_648.0f64.to_bits() },
            Inst::CvtFloatToInt { dst: R2, src: D1, to: IntKind::I32, mode: RoundingMode::ToZero },
            Inst::CvtFloatToInt { dst: R3, src: D1, to: IntKind::I64, mode: RoundingMode::ToZero },
        ]);
        assert_eq!(sim.reg(R2) as i64, i32::MIN as i64);
        assert_eq!(sim.reg(R3), 1 << 31);
    }

    #[test]
    fn test_double_to_int32_wraps() {
        assert_eq!(double_to_int32(4_294_967_298.5), 2);
        assert_eq!(double_to_int32(2_147_483_648.0), i32::MIN);
        assert_eq!(double_to_int32(-1.9), -1);
        assert_eq!(double_to_int32(f64::NAN), 0);
        assert_eq!(double_to_int32(f64::INFINITY), 0);
    }

    #[test]
    fn test_call_and_return_through_link_register() {
        let mut buf = CodeBuffer::new();
        let callee = buf.new_label();
        let end = buf.new_label();
        buf.emit(Inst::Mov { dst: R5, src: regs::LR });
        buf.emit(Inst::Call(Target::Label(callee)));
        buf.emit(Inst::Mov { dst: regs::LR, src: R5 });
        buf.emit(Inst::Jump(Target::Label(end)));
        buf.bind(callee);
        buf.emit(Inst::LoadImm { dst: R2, imm: 42 });
        buf.emit(Inst::Ret);
        buf.bind(end);
        buf.emit(Inst::Ret);
        let code = buf.finalize(WordWidth::W64).unwrap();
        let mut sim = Simulator::new(code, &EmitterConfig::default());
        sim.run().unwrap();
        assert_eq!(sim.reg(R2), 42);
        assert!(sim.halted);
    }

    #[test]
    fn test_stop_is_an_error() {
        let mut buf = CodeBuffer::new();
        buf.emit(Inst::Stop("boom".to_string()));
        let code = buf.finalize(WordWidth::W64).unwrap();
        let mut sim = Simulator::new(code, &EmitterConfig::default());
        assert_eq!(sim.run().unwrap_err(), SimError::Stop("boom".to_string()));
    }

    #[test]
    fn test_step_limit() {
        let mut buf = CodeBuffer::new();
        let top = buf.new_label();
        buf.bind(top);
        buf.emit(Inst::Jump(Target::Label(top)));
        let code = buf.finalize(WordWidth::W64).unwrap();
        let mut sim = Simulator::new(code, &EmitterConfig::default()).with_step_limit(100);
        assert_eq!(sim.run().unwrap_err(), SimError::StepLimit(100));
    }

    #[test]
    fn test_native_call() {
        let mut buf = CodeBuffer::new();
        buf.emit(Inst::LoadImm { dst: R2, imm: 20 });
        buf.emit(Inst::LoadImm { dst: R3, imm: 22 });
        buf.emit(Inst::LoadExternal { dst: regs::IP, ext: ExternalRef::CFunction(7) });
        buf.emit(Inst::Mov { dst: R5, src: regs::LR });
        buf.emit(Inst::Call(Target::Reg(regs::IP)));
        buf.emit(Inst::Mov { dst: regs::LR, src: R5 });
        let code = buf.finalize(WordWidth::W64).unwrap();
        let mut sim = Simulator::new(code, &EmitterConfig::default());
        sim.register_c_function(7, |args| args[0] + args[1]);
        sim.run().unwrap();
        assert_eq!(sim.reg(R2), 42);
        assert_eq!(sim.count_calls(|c| matches!(c, StubCall::CFunction { id: 7, .. })), 1);
    }
}
