//! mocasm - a macro-assembler policy layer for a managed runtime.
//!
//! The `masm` module turns high-level runtime operations (inline
//! allocation, write barriers, frame setup, calls with argument count
//! adaptation, numeric conversions) into sequences of primitive `asm`
//! instructions. With the `sim` feature the emitted code can be executed
//! against a small simulated heap.

pub mod asm;
pub mod config;
pub mod error;
pub mod layout;
pub mod masm;
#[cfg(feature = "sim")]
pub mod sim;

// Re-export commonly used types
pub use asm::{Code, CodeBuffer, Inst, Label, WordWidth};
pub use config::{EmitterConfig, FrameAlignment};
pub use error::{EmitError, SimError};
pub use layout::{AbortReason, HeapLayout};
pub use masm::MacroAssembler;
pub use masm::scenarios::{Program, Scenario};
#[cfg(feature = "sim")]
pub use sim::Simulator;
