//! Canned emission programs, one per high-level operation.
//!
//! Each scenario emits a small routine that takes its inputs in fixed
//! registers, performs one macro-assembler operation and returns. The
//! register conventions are listed per scenario so a host can set up the
//! inputs and read the outputs.

use std::fmt;
use std::str::FromStr;

use super::{
    AllocSize, AllocationFlags, EmitStats, InvokeFlag, LinkRegisterStatus, MacroAssembler,
    ParameterCount, PointersToHereCheck, SmiCheck,
};
use crate::asm::reg::{D0, D1, NO_REG, R1, R2, R3, R4, R5, R6, R7, R8, R9};
use crate::asm::{Code, Label, regs};
use crate::config::EmitterConfig;
use crate::error::EmitError;
use crate::layout::{ExternalRef, FrameType, RememberedSetAction, RootIndex, SaveFpRegsMode};

/// Id of the C function the exit-frame scenario calls.
pub const EXIT_FRAME_C_FUNCTION: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scenario {
    /// r3 = size in bytes -> r2 = tagged object, or undefined on the slow path
    Allocate,
    /// r3 = length -> r2 = one-byte string, or undefined on the slow path
    AllocateString,
    /// r3 = object, r4 = value stored into its first element
    RecordWrite,
    /// r3 = function, r2 = actual count -> r7 = count seen by the callee
    Invoke,
    /// r2 = C argument -> r2 = C result of (r2, 2), r7 = recorded fp,
    /// r8 = fp, r9 = sp inside the frame
    ExitFrame,
    /// d1 -> d0
    Floor,
    /// d1 -> d0
    Ceil,
    /// d1 -> r2
    Truncate,
}

impl Scenario {
    pub const ALL: [Scenario; 8] = [
        Scenario::Allocate,
        Scenario::AllocateString,
        Scenario::RecordWrite,
        Scenario::Invoke,
        Scenario::ExitFrame,
        Scenario::Floor,
        Scenario::Ceil,
        Scenario::Truncate,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Scenario::Allocate => "allocate",
            Scenario::AllocateString => "allocate-string",
            Scenario::RecordWrite => "record-write",
            Scenario::Invoke => "invoke",
            Scenario::ExitFrame => "exit-frame",
            Scenario::Floor => "floor",
            Scenario::Ceil => "ceil",
            Scenario::Truncate => "truncate",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Scenario::Allocate => "bump-allocate an object of a run-time size",
            Scenario::AllocateString => "allocate and initialize a sequential one-byte string",
            Scenario::RecordWrite => "store into an object field behind a write barrier",
            Scenario::Invoke => "call a function, adapting the argument count",
            Scenario::ExitFrame => "enter an exit frame and call into C",
            Scenario::Floor => "round a double towards minus infinity",
            Scenario::Ceil => "round a double towards plus infinity",
            Scenario::Truncate => "truncate a double to int32 with the stub fallback",
        }
    }

    pub fn emit(self, config: &EmitterConfig) -> Result<Program, EmitError> {
        let mut masm = MacroAssembler::new(config.clone());
        let entry = masm.new_label();
        masm.bind(entry);
        masm.comment(self.name());
        let mut callee = None;
        match self {
            Scenario::Allocate => emit_allocate(&mut masm)?,
            Scenario::AllocateString => emit_allocate_string(&mut masm)?,
            Scenario::RecordWrite => emit_record_write(&mut masm)?,
            Scenario::Invoke => callee = Some(emit_invoke(&mut masm)?),
            Scenario::ExitFrame => emit_exit_frame(&mut masm)?,
            Scenario::Floor => {
                masm.float_floor64(D0, D1, R2)?;
                masm.ret();
            }
            Scenario::Ceil => {
                masm.float_ceiling64(D0, D1, R2)?;
                masm.ret();
            }
            Scenario::Truncate => {
                masm.truncate_double_to_i(R2, D1);
                masm.ret();
            }
        }
        let stats = masm.stats();
        let code = masm.finish()?;
        Ok(Program { scenario: self, code, stats, entry, callee })
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Scenario {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scenario::ALL.iter().copied().find(|sc| sc.name() == s).ok_or_else(|| {
            let names: Vec<&str> = Scenario::ALL.iter().map(|sc| sc.name()).collect();
            format!("unknown scenario '{}' (expected one of: {})", s, names.join(", "))
        })
    }
}

/// An emitted scenario.
#[derive(Debug, Clone)]
pub struct Program {
    pub scenario: Scenario,
    pub code: Code,
    pub stats: EmitStats,
    pub entry: Label,
    /// Code of the function the invoke scenario calls
    pub callee: Option<Label>,
}

/// Common slow path: r2 = undefined.
fn emit_slow_path(masm: &mut MacroAssembler, gc_required: Label) {
    masm.bind(gc_required);
    masm.load_root(R2, RootIndex::UndefinedValue);
    masm.ret();
}

fn emit_allocate(masm: &mut MacroAssembler) -> Result<(), EmitError> {
    let gc_required = masm.new_label();
    masm.allocate(AllocSize::Reg(R3), R2, R4, R5, gc_required, AllocationFlags::TAG_OBJECT)?;
    masm.ret();
    emit_slow_path(masm, gc_required);
    Ok(())
}

fn emit_allocate_string(masm: &mut MacroAssembler) -> Result<(), EmitError> {
    let gc_required = masm.new_label();
    masm.allocate_one_byte_string(R2, R3, R4, R5, R6, gc_required)?;
    masm.ret();
    emit_slow_path(masm, gc_required);
    Ok(())
}

fn emit_record_write(masm: &mut MacroAssembler) -> Result<(), EmitError> {
    let offset = masm.layout().fixed_array_header_size();
    masm.store_p(R4, super::field_mem(R3, offset));
    masm.record_write_field(
        R3,
        offset,
        R4,
        R5,
        LinkRegisterStatus::HasNotBeenSaved,
        SaveFpRegsMode::DontSave,
        RememberedSetAction::Emit,
        SmiCheck::Inline,
        PointersToHereCheck::MaybeInteresting,
    )?;
    masm.ret();
    Ok(())
}

/// Returns the label of the callee's code.
fn emit_invoke(masm: &mut MacroAssembler) -> Result<Label, EmitError> {
    masm.enter_frame(FrameType::Internal);
    masm.invoke_function(R3, NO_REG, ParameterCount::Reg(R2), InvokeFlag::Call)?;
    masm.leave_frame(FrameType::Internal, 0);
    masm.ret();

    let callee = masm.new_label();
    masm.bind(callee);
    masm.mov(R7, R2);
    masm.ret();
    Ok(callee)
}

fn emit_exit_frame(masm: &mut MacroAssembler) -> Result<(), EmitError> {
    masm.enter_exit_frame(false, 2)?;
    masm.mov_external(R1, ExternalRef::CEntryFp);
    masm.load_p(R7, crate::asm::MemOperand::new(R1, 0));
    masm.mov(R8, regs::FP);
    masm.mov(R9, regs::SP);

    masm.prepare_call_c_function(2, 0, R5);
    masm.load_imm(R3, 2);
    masm.call_c_function(ExternalRef::CFunction(EXIT_FRAME_C_FUNCTION), 2, 0)?;

    masm.leave_exit_frame(false, NO_REG, true, false);
    masm.ret();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::{Inst, Stub, Target};

    #[test]
    fn test_names_roundtrip() {
        for scenario in Scenario::ALL {
            assert_eq!(scenario.name().parse::<Scenario>().unwrap(), scenario);
        }
        assert!("nope".parse::<Scenario>().unwrap_err().contains("allocate-string"));
    }

    #[test]
    fn test_every_scenario_emits() {
        for scenario in Scenario::ALL {
            let program = scenario.emit(&EmitterConfig::default()).unwrap();
            assert!(!program.code.is_empty(), "{} emitted nothing", scenario);
            assert_eq!(program.code.label_pc(program.entry), Some(0));
        }
    }

    #[test]
    fn test_record_write_counts_static_barriers() {
        let program = Scenario::RecordWrite.emit(&EmitterConfig::default()).unwrap();
        assert_eq!(program.stats.write_barriers_static, 1);
        let stub_calls = program.code.count(|i| matches!(i, Inst::Call(Target::Stub(Stub::RecordWrite { .. }))));
        assert_eq!(stub_calls, 1);
    }

    #[test]
    fn test_invoke_has_callee() {
        let program = Scenario::Invoke.emit(&EmitterConfig::default()).unwrap();
        let callee = program.callee.unwrap();
        assert!(program.code.label_pc(callee).is_some());
    }

    #[test]
    fn test_allocate_without_inline_new_is_slow() {
        let config = EmitterConfig::default().with_inline_new(false);
        let program = Scenario::Allocate.emit(&config).unwrap();
        assert_eq!(program.code.count(|i| matches!(i, Inst::LoadExternal { .. })), 0);
    }
}
