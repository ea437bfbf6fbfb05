//! Error types for code emission and simulation.

use thiserror::Error;

use crate::layout::AbortReason;

/// A programmer error detected while emitting code.
///
/// Conditions that can only be observed at run time are not reported here;
/// those are emitted as `check`/`abort` sequences instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmitError {
    #[error("label L{0} is used but never bound")]
    UnboundLabel(u32),
    #[error("label L{0} is bound more than once")]
    LabelBoundTwice(u32),
    #[error("registers must not alias: {0}")]
    AliasedRegisters(String),
    #[error("{op}: expected {expected}, got {got}")]
    WrongRegister {
        op: &'static str,
        expected: String,
        got: String,
    },
    #[error("{0}: invalid register operand")]
    InvalidRegister(&'static str),
    #[error("field offset {0} is not pointer aligned")]
    MisalignedOffset(i32),
    #[error("object size {0} is not a multiple of the object alignment")]
    MisalignedSize(i64),
    #[error("{0} requires an open frame")]
    FrameRequired(&'static str),
    #[error("runtime function {name} takes {expected} arguments, {got} given")]
    ArgumentCountMismatch {
        name: &'static str,
        expected: i32,
        got: i32,
    },
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

/// A failure raised by the simulator while running emitted code.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimError {
    #[error("abort: {0}")]
    Abort(AbortReason),
    #[error("abort with unknown reason code {0}")]
    UnknownAbort(i64),
    #[error("stop: {0}")]
    Stop(String),
    #[error("no code or native routine at {0:#x}")]
    InvalidCallTarget(u64),
    #[error("no runtime function at {0:#x}")]
    UnknownRuntimeFunction(u64),
    #[error("label L{0} is not bound")]
    UnboundLabel(u32),
    #[error("step limit of {0} exceeded")]
    StepLimit(u64),
    #[error("integer division by zero")]
    DivisionByZero,
    #[error("native routine {name} failed: {message}")]
    Native { name: String, message: String },
}
