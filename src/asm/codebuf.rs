//! Code buffer for building instruction streams.
//!
//! Labels may be used before they are bound; such uses are kept as forward
//! references and resolved when the label is bound. Misuse (binding a label
//! twice, leaving a used label unbound) is reported by `finalize`.

use std::fmt;

use super::inst::{Inst, Label};
use super::width::WordWidth;
use crate::error::EmitError;

/// A buffer for building an instruction stream.
pub struct CodeBuffer {
    /// The instructions
    insts: Vec<Inst>,
    /// Bound position of each label (label id -> instruction index)
    labels: Vec<Option<usize>>,
    /// Uses of labels that were not yet bound (instruction index, label)
    forward_refs: Vec<(usize, Label)>,
    /// First misuse seen, reported on finalize
    error: Option<EmitError>,
}

impl CodeBuffer {
    /// Create a new empty code buffer.
    pub fn new() -> Self {
        Self {
            insts: Vec::new(),
            labels: Vec::new(),
            forward_refs: Vec::new(),
            error: None,
        }
    }

    /// Create a new code buffer with pre-allocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            insts: Vec::with_capacity(capacity),
            ..Self::new()
        }
    }

    /// Get the number of emitted instructions.
    pub fn len(&self) -> usize {
        self.insts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    /// Get the current offset (for labels).
    pub fn offset(&self) -> usize {
        self.insts.len()
    }

    /// Emit one instruction.
    pub fn emit(&mut self, inst: Inst) {
        if let Some(label) = inst.label_ref() {
            if self.get_label(label).is_none() {
                self.forward_refs.push((self.insts.len(), label));
            }
        }
        self.insts.push(inst);
    }

    /// Create a fresh, unbound label.
    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label((self.labels.len() - 1) as u32)
    }

    /// Bind a label at the current position and resolve pending uses of it.
    pub fn bind(&mut self, label: Label) {
        let here = self.insts.len();
        match self.labels.get_mut(label.0 as usize) {
            Some(slot) if slot.is_none() => *slot = Some(here),
            _ => {
                self.error.get_or_insert(EmitError::LabelBoundTwice(label.0));
                return;
            }
        }
        self.forward_refs.retain(|(_, l)| *l != label);
    }

    /// Get the position of a label (if bound).
    pub fn get_label(&self, label: Label) -> Option<usize> {
        self.labels.get(label.0 as usize).copied().flatten()
    }

    pub fn is_bound(&self, label: Label) -> bool {
        self.get_label(label).is_some()
    }

    /// Check that no forward reference is left unresolved.
    pub fn patch_forward_refs(&self) -> Result<(), EmitError> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        match self.forward_refs.first() {
            Some((_, label)) => Err(EmitError::UnboundLabel(label.0)),
            None => Ok(()),
        }
    }

    /// Get the instructions (for inspection).
    pub fn insts(&self) -> &[Inst] {
        &self.insts
    }

    /// Finish the buffer.
    pub fn finalize(self, width: WordWidth) -> Result<Code, EmitError> {
        self.patch_forward_refs()?;
        Ok(Code {
            insts: self.insts,
            labels: self.labels,
            width,
        })
    }
}

impl Default for CodeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// A finished instruction stream with every used label bound.
#[derive(Debug, Clone)]
pub struct Code {
    insts: Vec<Inst>,
    labels: Vec<Option<usize>>,
    width: WordWidth,
}

impl Code {
    pub fn insts(&self) -> &[Inst] {
        &self.insts
    }

    pub fn len(&self) -> usize {
        self.insts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    pub fn width(&self) -> WordWidth {
        self.width
    }

    /// Instruction index a label is bound to.
    pub fn label_pc(&self, label: Label) -> Option<usize> {
        self.labels.get(label.0 as usize).copied().flatten()
    }

    /// Number of instructions matching a predicate.
    pub fn count(&self, pred: impl Fn(&Inst) -> bool) -> usize {
        self.insts.iter().filter(|i| pred(i)).count()
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (pc, inst) in self.insts.iter().enumerate() {
            for (id, _) in self.labels.iter().enumerate().filter(|(_, p)| **p == Some(pc)) {
                writeln!(f, "L{}:", id)?;
            }
            writeln!(f, "  {:4}  {}", pc, inst)?;
        }
        for (id, _) in self.labels.iter().enumerate().filter(|(_, p)| **p == Some(self.insts.len())) {
            writeln!(f, "L{}:", id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::inst::{Cond, Target};
    use crate::asm::reg::R2;

    #[test]
    fn test_emit() {
        let mut buf = CodeBuffer::new();
        buf.emit(Inst::Nop);
        buf.emit(Inst::LoadImm { dst: R2, imm: 1 });
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.insts()[1], Inst::LoadImm { dst: R2, imm: 1 });
    }

    #[test]
    fn test_labels() {
        let mut buf = CodeBuffer::new();
        let label = buf.new_label();
        buf.emit(Inst::Nop);
        buf.bind(label);
        buf.emit(Inst::Nop);

        assert_eq!(buf.get_label(label), Some(1));
    }

    #[test]
    fn test_forward_reference_resolved_at_bind() {
        let mut buf = CodeBuffer::new();
        let done = buf.new_label();
        buf.emit(Inst::Branch { cond: Cond::Eq, target: done });
        assert!(buf.patch_forward_refs().is_err());
        buf.emit(Inst::Nop);
        buf.bind(done);
        assert!(buf.patch_forward_refs().is_ok());
        let code = buf.finalize(WordWidth::W64).unwrap();
        assert_eq!(code.label_pc(done), Some(2));
    }

    #[test]
    fn test_unbound_label_rejected() {
        let mut buf = CodeBuffer::new();
        let l = buf.new_label();
        buf.emit(Inst::Jump(Target::Label(l)));
        assert_eq!(buf.finalize(WordWidth::W64).unwrap_err(), EmitError::UnboundLabel(l.id()));
    }

    #[test]
    fn test_double_bind_rejected() {
        let mut buf = CodeBuffer::new();
        let l = buf.new_label();
        buf.bind(l);
        buf.emit(Inst::Nop);
        buf.bind(l);
        assert_eq!(buf.get_label(l), Some(0));
        assert_eq!(buf.finalize(WordWidth::W64).unwrap_err(), EmitError::LabelBoundTwice(l.id()));
    }

    #[test]
    fn test_unused_label_is_fine() {
        let mut buf = CodeBuffer::new();
        let _unused = buf.new_label();
        buf.emit(Inst::Ret);
        assert!(buf.finalize(WordWidth::W64).is_ok());
    }
}
