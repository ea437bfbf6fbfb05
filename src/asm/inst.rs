//! The primitive instruction set.
//!
//! The macro-assembler emits `Inst` values; how each one is encoded for a
//! real CPU is outside this crate. Integer operations come in a 32-bit and a
//! 64-bit flavor, condition codes are set by arithmetic, compares and tests
//! and consumed by `Branch`.

use std::fmt;

use super::operand::{MemOperand, Operand};
use super::reg::{DoubleRegister, Register};
use super::width::OpSize;
use crate::layout::{ExternalRef, RememberedSetAction, SaveFpRegsMode};

/// A branch target inside the current emission pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub(crate) u32);

impl Label {
    pub fn id(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Condition tested by a conditional branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    /// Signed less than
    Lt,
    Ge,
    Le,
    Gt,
    /// Unsigned less than
    Below,
    AboveEqual,
    BelowEqual,
    Above,
    Overflow,
    NoOverflow,
    /// At least one operand of a floating point compare was NaN
    Unordered,
    Ordered,
}

impl Cond {
    /// Get the inverted condition.
    pub fn invert(self) -> Self {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Lt => Cond::Ge,
            Cond::Ge => Cond::Lt,
            Cond::Le => Cond::Gt,
            Cond::Gt => Cond::Le,
            Cond::Below => Cond::AboveEqual,
            Cond::AboveEqual => Cond::Below,
            Cond::BelowEqual => Cond::Above,
            Cond::Above => Cond::BelowEqual,
            Cond::Overflow => Cond::NoOverflow,
            Cond::NoOverflow => Cond::Overflow,
            Cond::Unordered => Cond::Ordered,
            Cond::Ordered => Cond::Unordered,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Cond::Eq => "eq",
            Cond::Ne => "ne",
            Cond::Lt => "lt",
            Cond::Ge => "ge",
            Cond::Le => "le",
            Cond::Gt => "gt",
            Cond::Below => "lo",
            Cond::AboveEqual => "hs",
            Cond::BelowEqual => "ls",
            Cond::Above => "hi",
            Cond::Overflow => "ov",
            Cond::NoOverflow => "nov",
            Cond::Unordered => "un",
            Cond::Ordered => "ord",
        }
    }
}

/// Width and signedness of a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
}

impl MemType {
    pub fn size(self) -> usize {
        match self {
            MemType::U8 | MemType::I8 => 1,
            MemType::U16 | MemType::I16 => 2,
            MemType::U32 | MemType::I32 => 4,
            MemType::U64 => 8,
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            MemType::U8 => "u8",
            MemType::I8 => "i8",
            MemType::U16 => "u16",
            MemType::I16 => "i16",
            MemType::U32 => "u32",
            MemType::I32 => "i32",
            MemType::U64 => "u64",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    Mul,
    Div,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
}

impl AluOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            AluOp::Add => "add",
            AluOp::Sub => "sub",
            AluOp::Mul => "mul",
            AluOp::Div => "div",
            AluOp::And => "and",
            AluOp::Or => "or",
            AluOp::Xor => "xor",
            AluOp::Shl => "shl",
            AluOp::Shr => "shr",
            AluOp::Sar => "sar",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FAluOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Integer kinds for conversions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntKind {
    I32,
    U32,
    I64,
    U64,
}

/// Floating point kinds for conversions. `F32` results are kept widened in
/// a double register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatKind {
    F32,
    F64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundingMode {
    ToZero,
    ToNearestEven,
    ToPlusInf,
    ToMinusInf,
}

impl RoundingMode {
    pub fn mnemonic(self) -> &'static str {
        match self {
            RoundingMode::ToZero => "rz",
            RoundingMode::ToNearestEven => "rn",
            RoundingMode::ToPlusInf => "rp",
            RoundingMode::ToMinusInf => "rm",
        }
    }
}

/// Out-of-line code the emitted code calls into. Stubs are specialized on
/// the registers they read, like the code objects they stand for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stub {
    /// Records `slot` (holding `value`) of `object` in the remembered set and
    /// informs the incremental marker.
    RecordWrite {
        object: Register,
        value: Register,
        address: Register,
        remembered_set_action: RememberedSetAction,
        fp_mode: SaveFpRegsMode,
    },
    /// Flushes a full store buffer.
    StoreBufferOverflow { fp_mode: SaveFpRegsMode },
    /// Enters the runtime: r2 holds the argument count, r3 the function.
    CEntry { result_size: u8, save_doubles: SaveFpRegsMode },
    /// Truncates the double at `[source + offset]` to an int32 in `result`.
    DoubleToI {
        source: Register,
        result: Register,
        offset: i32,
    },
    /// Adapts actual (r2) to expected (r4) argument count and calls the
    /// function in r3.
    ArgumentsAdaptor,
}

impl fmt::Display for Stub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stub::RecordWrite { object, value, address, .. } => {
                write!(f, "RecordWriteStub({}, {}, {})", object, value, address)
            }
            Stub::StoreBufferOverflow { .. } => write!(f, "StoreBufferOverflowStub"),
            Stub::CEntry { result_size, .. } => write!(f, "CEntryStub({})", result_size),
            Stub::DoubleToI { source, result, offset } => {
                write!(f, "DoubleToIStub([{} + {}] -> {})", source, offset, result)
            }
            Stub::ArgumentsAdaptor => write!(f, "ArgumentsAdaptorTrampoline"),
        }
    }
}

/// Destination of a call or jump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Label(Label),
    Reg(Register),
    Stub(Stub),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Label(l) => write!(f, "{}", l),
            Target::Reg(r) => write!(f, "{}", r),
            Target::Stub(s) => write!(f, "{}", s),
        }
    }
}

/// A primitive instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Inst {
    // ========================================
    // Moves and memory
    // ========================================
    /// dst = src (full register)
    Mov { dst: Register, src: Register },
    /// dst = imm
    LoadImm { dst: Register, imm: i64 },
    /// dst = address (or value) of an external reference
    LoadExternal { dst: Register, ext: ExternalRef },
    /// dst = extend(mem)
    Load { dst: Register, mem: MemOperand, ty: MemType },
    /// mem = low bits of src
    Store { src: Register, mem: MemOperand, ty: MemType },
    /// mem = imm
    StoreImm { mem: MemOperand, imm: i64, ty: MemType },
    /// dst = effective address of mem (pointer-sized, flags untouched)
    Lea { dst: Register, mem: MemOperand },
    /// dst = low bits of src, sign or zero extended per `ty`
    Extend { dst: Register, src: Register, ty: MemType },

    // ========================================
    // Integer arithmetic (sets condition codes)
    // ========================================
    /// dst = lhs op rhs
    Alu {
        op: AluOp,
        size: OpSize,
        dst: Register,
        lhs: Register,
        rhs: Operand,
    },
    /// dst = op src
    Unary {
        op: UnaryOp,
        size: OpSize,
        dst: Register,
        src: Register,
    },
    /// Compare lhs with rhs, signed and unsigned at once.
    Cmp {
        size: OpSize,
        lhs: Register,
        rhs: Operand,
    },
    /// Set condition codes from lhs & rhs.
    Test {
        size: OpSize,
        lhs: Register,
        rhs: Operand,
    },

    // ========================================
    // Floating point
    // ========================================
    MovD { dst: DoubleRegister, src: DoubleRegister },
    LoadD { dst: DoubleRegister, mem: MemOperand },
    StoreD { src: DoubleRegister, mem: MemOperand },
    /// dst = bit pattern
    LoadDImm { dst: DoubleRegister, bits: u64 },
    FAlu {
        op: FAluOp,
        dst: DoubleRegister,
        lhs: DoubleRegister,
        rhs: DoubleRegister,
    },
    /// Compare two doubles; NaN operands compare unordered.
    FCmp { lhs: DoubleRegister, rhs: DoubleRegister },
    CvtIntToFloat {
        dst: DoubleRegister,
        src: Register,
        from: IntKind,
        to: FloatKind,
    },
    /// Convert with rounding; NaN and out of range inputs set overflow and
    /// produce the most negative integer.
    CvtFloatToInt {
        dst: Register,
        src: DoubleRegister,
        to: IntKind,
        mode: RoundingMode,
    },
    /// Round to an integral double.
    RoundD {
        dst: DoubleRegister,
        src: DoubleRegister,
        mode: RoundingMode,
    },
    /// Move raw bits from a double register.
    MovDToGpr { dst: Register, src: DoubleRegister },
    /// Move raw bits into a double register.
    MovGprToD { dst: DoubleRegister, src: Register },

    // ========================================
    // Control flow
    // ========================================
    Jump(Target),
    Branch { cond: Cond, target: Label },
    /// Call; the return address goes to the link register.
    Call(Target),
    /// Jump to the link register.
    Ret,
    /// Stop execution with a message.
    Stop(String),

    // ========================================
    // Misc
    // ========================================
    Comment(String),
    Nop,
}

impl Inst {
    /// The label this instruction refers to, if any.
    pub fn label_ref(&self) -> Option<Label> {
        match self {
            Inst::Jump(Target::Label(l)) | Inst::Call(Target::Label(l)) => Some(*l),
            Inst::Branch { target, .. } => Some(*target),
            _ => None,
        }
    }

    pub fn is_call(&self) -> bool {
        matches!(self, Inst::Call(_))
    }
}

fn size_suffix(size: OpSize) -> &'static str {
    match size {
        OpSize::S32 => "w",
        OpSize::S64 => "",
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inst::Mov { dst, src } => write!(f, "mov {}, {}", dst, src),
            Inst::LoadImm { dst, imm } => write!(f, "li {}, {}", dst, imm),
            Inst::LoadExternal { dst, ext } => write!(f, "li {}, &{}", dst, ext),
            Inst::Load { dst, mem, ty } => write!(f, "ld.{} {}, {}", ty.suffix(), dst, mem),
            Inst::Store { src, mem, ty } => write!(f, "st.{} {}, {}", ty.suffix(), src, mem),
            Inst::StoreImm { mem, imm, ty } => write!(f, "st.{} #{}, {}", ty.suffix(), imm, mem),
            Inst::Lea { dst, mem } => write!(f, "lea {}, {}", dst, mem),
            Inst::Extend { dst, src, ty } => write!(f, "ext.{} {}, {}", ty.suffix(), dst, src),
            Inst::Alu { op, size, dst, lhs, rhs } => {
                write!(f, "{}{} {}, {}, {}", op.mnemonic(), size_suffix(*size), dst, lhs, rhs)
            }
            Inst::Unary { op, size, dst, src } => {
                let m = match op {
                    UnaryOp::Neg => "neg",
                    UnaryOp::Not => "not",
                };
                write!(f, "{}{} {}, {}", m, size_suffix(*size), dst, src)
            }
            Inst::Cmp { size, lhs, rhs } => write!(f, "cmp{} {}, {}", size_suffix(*size), lhs, rhs),
            Inst::Test { size, lhs, rhs } => write!(f, "tst{} {}, {}", size_suffix(*size), lhs, rhs),
            Inst::MovD { dst, src } => write!(f, "movd {}, {}", dst, src),
            Inst::LoadD { dst, mem } => write!(f, "ldd {}, {}", dst, mem),
            Inst::StoreD { src, mem } => write!(f, "std {}, {}", src, mem),
            Inst::LoadDImm { dst, bits } => {
                write!(f, "lid {}, {} ({:#018x})", dst, f64::from_bits(*bits), bits)
            }
            Inst::FAlu { op, dst, lhs, rhs } => {
                let m = match op {
                    FAluOp::Add => "fadd",
                    FAluOp::Sub => "fsub",
                    FAluOp::Mul => "fmul",
                    FAluOp::Div => "fdiv",
                };
                write!(f, "{} {}, {}, {}", m, dst, lhs, rhs)
            }
            Inst::FCmp { lhs, rhs } => write!(f, "fcmp {}, {}", lhs, rhs),
            Inst::CvtIntToFloat { dst, src, from, to } => {
                write!(f, "cvt.{:?}.{:?} {}, {}", from, to, dst, src)
            }
            Inst::CvtFloatToInt { dst, src, to, mode } => {
                write!(f, "cvt.f64.{:?}.{} {}, {}", to, mode.mnemonic(), dst, src)
            }
            Inst::RoundD { dst, src, mode } => write!(f, "fround.{} {}, {}", mode.mnemonic(), dst, src),
            Inst::MovDToGpr { dst, src } => write!(f, "lgdr {}, {}", dst, src),
            Inst::MovGprToD { dst, src } => write!(f, "ldgr {}, {}", dst, src),
            Inst::Jump(t) => write!(f, "b {}", t),
            Inst::Branch { cond, target } => write!(f, "b{} {}", cond.mnemonic(), target),
            Inst::Call(t) => write!(f, "call {}", t),
            Inst::Ret => write!(f, "ret"),
            Inst::Stop(msg) => write!(f, "stop \"{}\"", msg),
            Inst::Comment(text) => write!(f, "; {}", text),
            Inst::Nop => write!(f, "nop"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::reg::{R2, R3};

    #[test]
    fn test_cond_invert() {
        for cond in [Cond::Eq, Cond::Lt, Cond::Le, Cond::Below, Cond::Above, Cond::Overflow] {
            assert_eq!(cond.invert().invert(), cond);
            assert_ne!(cond.invert(), cond);
        }
        assert_eq!(Cond::Lt.invert(), Cond::Ge);
        assert_eq!(Cond::BelowEqual.invert(), Cond::Above);
    }

    #[test]
    fn test_label_ref() {
        let l = Label(3);
        assert_eq!(Inst::Branch { cond: Cond::Eq, target: l }.label_ref(), Some(l));
        assert_eq!(Inst::Call(Target::Label(l)).label_ref(), Some(l));
        assert_eq!(Inst::Call(Target::Reg(R2)).label_ref(), None);
    }

    #[test]
    fn test_listing() {
        let inst = Inst::Alu {
            op: AluOp::Add,
            size: OpSize::S32,
            dst: R2,
            lhs: R3,
            rhs: Operand::Imm(4),
        };
        assert_eq!(inst.to_string(), "addw r2, r3, #4");
        let load = Inst::Load { dst: R2, mem: MemOperand::new(R3, 8), ty: MemType::U64 };
        assert_eq!(load.to_string(), "ld.u64 r2, [r3 + 8]");
    }
}
