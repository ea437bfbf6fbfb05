//! Primitive instruction layer: registers, operands, instructions and the
//! code buffer they are collected in.

pub mod codebuf;
pub mod inst;
pub mod operand;
pub mod reg;
pub mod width;

pub use codebuf::{Code, CodeBuffer};
pub use inst::{
    AluOp, Cond, FAluOp, FloatKind, Inst, IntKind, Label, MemType, RoundingMode, Stub, Target,
    UnaryOp,
};
pub use operand::{MemOperand, Operand};
pub use reg::{DoubleRegister, RegList, Register, are_aliased, regs};
pub use width::{OpSize, WordWidth};
