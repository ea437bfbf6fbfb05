//! Inline bump-pointer allocation.
//!
//! The fast path reads the top and limit cells of the target space (the
//! limit cell sits one pointer after the top cell), checks that the request
//! fits, commits the new top and optionally tags the result. Exhaustion is a
//! branch to the caller's slow-path label; the top cell is only written once
//! the bounds check has passed.

use std::ops::BitOr;

use super::{MacroAssembler, field_mem};
use crate::asm::operand::is_int16;
use crate::asm::reg::R0;
use crate::asm::{Cond, DoubleRegister, Label, MemOperand, Register, regs};
use crate::error::EmitError;
use crate::layout::{
    ALLOCATION_POISON, AbortReason, EMPTY_HASH_FIELD, ExternalRef, HEAP_OBJECT_TAG, RootIndex,
};

/// Allocation policy bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationFlags(u8);

impl AllocationFlags {
    pub const NONE: AllocationFlags = AllocationFlags(0);
    /// Return the result tagged as a heap object pointer
    pub const TAG_OBJECT: AllocationFlags = AllocationFlags(1 << 0);
    /// The size is a number of pointer-sized words
    pub const SIZE_IN_WORDS: AllocationFlags = AllocationFlags(1 << 1);
    /// Align the result to a double boundary
    pub const DOUBLE_ALIGNMENT: AllocationFlags = AllocationFlags(1 << 2);
    /// Allocate in old space
    pub const PRETENURE: AllocationFlags = AllocationFlags(1 << 3);
    /// The result register already holds the allocation top
    pub const RESULT_CONTAINS_TOP: AllocationFlags = AllocationFlags(1 << 4);

    pub fn contains(self, other: AllocationFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AllocationFlags {
    type Output = AllocationFlags;

    fn bitor(self, rhs: AllocationFlags) -> AllocationFlags {
        AllocationFlags(self.0 | rhs.0)
    }
}

/// Requested object size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocSize {
    /// Known at emission time
    Imm(i32),
    /// Held in a register at run time
    Reg(Register),
}

/// Registers holding the outcome of a successful inline allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatedRegs {
    /// Start of the object (tagged when requested)
    pub result: Register,
    /// New allocation top
    pub result_end: Register,
}

/// What the emitted sequence does on the fall-through path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    /// Falls through with the object allocated; exhaustion branches to the
    /// slow-path label.
    Inline(AllocatedRegs),
    /// Inline allocation is disabled: the sequence always branches to the
    /// slow-path label.
    AlwaysSlow,
}

impl Allocation {
    pub fn is_inline(&self) -> bool {
        matches!(self, Allocation::Inline(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaggingMode {
    TagResult,
    DontTagResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutableMode {
    Immutable,
    Mutable,
}

impl MacroAssembler {
    /// Allocate an object of `size` bytes (or words) in new or old space.
    ///
    /// `scratch` receives the address of the top cell and `result_end` the
    /// new top; ip and r0 are clobbered. A register size may share its
    /// register with `result_end` unless double alignment is requested.
    pub fn allocate(
        &mut self,
        size: AllocSize,
        result: Register,
        result_end: Register,
        scratch: Register,
        gc_required: Label,
        flags: AllocationFlags,
    ) -> Result<Allocation, EmitError> {
        self.check_valid("allocate", &[result, result_end, scratch])?;
        if let AllocSize::Reg(size_reg) = size {
            self.check_valid("allocate size", &[size_reg])?;
        }
        if !self.config.inline_new {
            if self.emit_debug_code() {
                // Poison the outputs so a use before the slow path shows up.
                self.load_imm(result, ALLOCATION_POISON[0]);
                self.load_imm(scratch, ALLOCATION_POISON[1]);
                self.load_imm(result_end, ALLOCATION_POISON[2]);
            }
            self.b(gc_required);
            self.trace(format_args!("allocate {:?}: inline allocation disabled", size));
            return Ok(Allocation::AlwaysSlow);
        }

        match size {
            AllocSize::Imm(_) => {
                self.check_not_aliased("allocate", &[result, result_end, scratch, regs::IP])?;
            }
            AllocSize::Reg(size_reg) => {
                self.check_not_aliased("allocate", &[size_reg, result, scratch, regs::IP])?;
                self.check_not_aliased("allocate", &[result_end, result, scratch, regs::IP])?;
                if flags.contains(AllocationFlags::DOUBLE_ALIGNMENT) && size_reg == result_end {
                    return Err(EmitError::AliasedRegisters(format!(
                        "allocate({}, {}) with double alignment",
                        size_reg, result_end
                    )));
                }
            }
        }

        let ptr = self.ptr();
        let size = match size {
            AllocSize::Imm(words) if flags.contains(AllocationFlags::SIZE_IN_WORDS) => {
                AllocSize::Imm(words * ptr)
            }
            other => other,
        };
        if let AllocSize::Imm(bytes) = size {
            if bytes as i64 & self.layout.object_alignment_mask() != 0 {
                return Err(EmitError::MisalignedSize(bytes as i64));
            }
        }
        self.trace(format_args!("allocate {:?} -> {} ({:?})", size, result, flags));

        // The limit cell is read through the top address.
        let top = if flags.contains(AllocationFlags::PRETENURE) {
            ExternalRef::OldSpaceAllocationTop
        } else {
            ExternalRef::NewSpaceAllocationTop
        };
        let top_address = scratch;
        let alloc_limit = regs::IP;
        self.mov_external(top_address, top);

        if !flags.contains(AllocationFlags::RESULT_CONTAINS_TOP) {
            self.load_p(result, MemOperand::new(top_address, 0));
            self.load_p(alloc_limit, MemOperand::new(top_address, ptr));
        } else {
            if self.emit_debug_code() {
                self.load_p(alloc_limit, MemOperand::new(top_address, 0));
                self.cmp_p(result, alloc_limit);
                self.check(Cond::Eq, AbortReason::UnexpectedAllocationTop);
            }
            self.load_p(alloc_limit, MemOperand::new(top_address, ptr));
        }

        if flags.contains(AllocationFlags::DOUBLE_ALIGNMENT) && !self.width().is_64bit() {
            // Pointer alignment is half the double alignment here: burn one
            // word with a filler when the top is misaligned.
            let aligned = self.new_label();
            let mask = self.layout.double_alignment_mask();
            self.and_p(result_end, result, mask);
            self.branch(Cond::Eq, aligned);
            if flags.contains(AllocationFlags::PRETENURE) {
                self.cmp_p(result, alloc_limit);
                self.branch(Cond::AboveEqual, gc_required);
            }
            self.load_root(result_end, RootIndex::OnePointerFillerMap);
            self.store_w(result_end, MemOperand::new(result, 0));
            self.add_p(result, result, ptr);
            self.bind(aligned);
        }

        // available = limit - top; exhausted when available < size.
        self.sub_p(R0, alloc_limit, result);
        match size {
            AllocSize::Imm(bytes) if is_int16(bytes as i64) => {
                self.cmp_p(R0, bytes as i64);
                self.branch(Cond::Below, gc_required);
                self.add_p(result_end, result, bytes as i64);
            }
            AllocSize::Imm(bytes) => {
                self.load_imm(result_end, bytes as i64);
                self.cmp_p(R0, result_end);
                self.branch(Cond::Below, gc_required);
                self.add_p(result_end, result, result_end);
            }
            AllocSize::Reg(size_reg) => {
                if flags.contains(AllocationFlags::SIZE_IN_WORDS) {
                    let log2 = self.width().pointer_size_log2() as i64;
                    self.shift_left_p(result_end, size_reg, log2);
                    self.cmp_p(R0, result_end);
                    self.branch(Cond::Below, gc_required);
                    self.add_p(result_end, result, result_end);
                } else {
                    self.cmp_p(R0, size_reg);
                    self.branch(Cond::Below, gc_required);
                    self.add_p(result_end, result, size_reg);
                }
                if self.emit_debug_code() {
                    let mask = self.layout.object_alignment_mask();
                    self.and_p(R0, result_end, mask);
                    self.check(Cond::Eq, AbortReason::UnalignedAllocationInNewSpace);
                }
            }
        }
        self.store_p(result_end, MemOperand::new(top_address, 0));

        if flags.contains(AllocationFlags::TAG_OBJECT) {
            self.add_p(result, result, HEAP_OBJECT_TAG as i64);
        }
        Ok(Allocation::Inline(AllocatedRegs { result, result_end }))
    }

    /// Write map, Smi length and empty hash field of a fresh string.
    pub fn initialize_new_string(
        &mut self,
        string: Register,
        length: Register,
        map_index: RootIndex,
        scratch1: Register,
        scratch2: Register,
    ) {
        let length_offset = self.layout.string_length_offset();
        let hash_offset = self.layout.string_hash_field_offset();
        let map_offset = self.layout.map_offset();
        self.smi_tag(scratch1, length);
        self.load_root(scratch2, map_index);
        self.store_p(scratch1, field_mem(string, length_offset));
        self.store_imm_p(field_mem(string, hash_offset), EMPTY_HASH_FIELD);
        self.store_p(scratch2, field_mem(string, map_offset));
    }

    /// Allocate a sequential two-byte string for the untagged `length`.
    pub fn allocate_two_byte_string(
        &mut self,
        result: Register,
        length: Register,
        scratch1: Register,
        scratch2: Register,
        scratch3: Register,
        gc_required: Label,
    ) -> Result<Allocation, EmitError> {
        self.check_not_aliased("allocate_two_byte_string", &[result, length, scratch1, scratch2, scratch3])?;
        let mask = self.layout.object_alignment_mask();
        let header = self.layout.seq_string_header_size() as i64;
        self.shift_left_p(scratch1, length, 1i64);
        self.add_p(scratch1, scratch1, mask + header);
        self.and_p(scratch1, scratch1, !mask);

        let allocation = self.allocate(
            AllocSize::Reg(scratch1),
            result,
            scratch2,
            scratch3,
            gc_required,
            AllocationFlags::TAG_OBJECT,
        )?;
        if allocation.is_inline() {
            self.initialize_new_string(result, length, RootIndex::StringMap, scratch1, scratch2);
        }
        Ok(allocation)
    }

    /// Allocate a sequential one-byte string for the untagged `length`.
    pub fn allocate_one_byte_string(
        &mut self,
        result: Register,
        length: Register,
        scratch1: Register,
        scratch2: Register,
        scratch3: Register,
        gc_required: Label,
    ) -> Result<Allocation, EmitError> {
        self.check_not_aliased("allocate_one_byte_string", &[result, length, scratch1, scratch2, scratch3])?;
        let mask = self.layout.object_alignment_mask();
        let header = self.layout.seq_string_header_size() as i64;
        self.add_p(scratch1, length, mask + header);
        self.and_p(scratch1, scratch1, !mask);

        let allocation = self.allocate(
            AllocSize::Reg(scratch1),
            result,
            scratch2,
            scratch3,
            gc_required,
            AllocationFlags::TAG_OBJECT,
        )?;
        if allocation.is_inline() {
            self.initialize_new_string(result, length, RootIndex::OneByteStringMap, scratch1, scratch2);
        }
        Ok(allocation)
    }

    fn allocate_fixed_string(
        &mut self,
        size: i32,
        map_index: RootIndex,
        result: Register,
        length: Register,
        scratch1: Register,
        scratch2: Register,
        gc_required: Label,
    ) -> Result<Allocation, EmitError> {
        self.check_not_aliased("allocate_string", &[result, length, scratch1, scratch2])?;
        let allocation = self.allocate(
            AllocSize::Imm(size),
            result,
            scratch2,
            scratch1,
            gc_required,
            AllocationFlags::TAG_OBJECT,
        )?;
        if allocation.is_inline() {
            self.initialize_new_string(result, length, map_index, scratch1, scratch2);
        }
        Ok(allocation)
    }

    pub fn allocate_two_byte_cons_string(
        &mut self,
        result: Register,
        length: Register,
        scratch1: Register,
        scratch2: Register,
        gc_required: Label,
    ) -> Result<Allocation, EmitError> {
        let size = self.layout.cons_string_size();
        self.allocate_fixed_string(size, RootIndex::ConsStringMap, result, length, scratch1, scratch2, gc_required)
    }

    pub fn allocate_one_byte_cons_string(
        &mut self,
        result: Register,
        length: Register,
        scratch1: Register,
        scratch2: Register,
        gc_required: Label,
    ) -> Result<Allocation, EmitError> {
        let size = self.layout.cons_string_size();
        self.allocate_fixed_string(size, RootIndex::ConsOneByteStringMap, result, length, scratch1, scratch2, gc_required)
    }

    pub fn allocate_two_byte_sliced_string(
        &mut self,
        result: Register,
        length: Register,
        scratch1: Register,
        scratch2: Register,
        gc_required: Label,
    ) -> Result<Allocation, EmitError> {
        let size = self.layout.sliced_string_size();
        self.allocate_fixed_string(size, RootIndex::SlicedStringMap, result, length, scratch1, scratch2, gc_required)
    }

    pub fn allocate_one_byte_sliced_string(
        &mut self,
        result: Register,
        length: Register,
        scratch1: Register,
        scratch2: Register,
        gc_required: Label,
    ) -> Result<Allocation, EmitError> {
        let size = self.layout.sliced_string_size();
        self.allocate_fixed_string(size, RootIndex::SlicedOneByteStringMap, result, length, scratch1, scratch2, gc_required)
    }

    /// Allocate a heap number and store its map; the value is left unset.
    #[allow(clippy::too_many_arguments)]
    pub fn allocate_heap_number(
        &mut self,
        result: Register,
        scratch1: Register,
        scratch2: Register,
        heap_number_map: Register,
        gc_required: Label,
        tagging: TaggingMode,
        mode: MutableMode,
    ) -> Result<Allocation, EmitError> {
        let size = self.layout.heap_number_size();
        let flags = match tagging {
            TaggingMode::TagResult => AllocationFlags::TAG_OBJECT,
            TaggingMode::DontTagResult => AllocationFlags::NONE,
        };
        let allocation = self.allocate(AllocSize::Imm(size), result, scratch2, scratch1, gc_required, flags)?;
        if allocation.is_inline() {
            let map_index = match mode {
                MutableMode::Mutable => RootIndex::MutableHeapNumberMap,
                MutableMode::Immutable => RootIndex::HeapNumberMap,
            };
            self.load_root(heap_number_map, map_index);
            let map_offset = self.layout.map_offset();
            let mem = match tagging {
                TaggingMode::TagResult => field_mem(result, map_offset),
                TaggingMode::DontTagResult => MemOperand::new(result, map_offset),
            };
            self.store_p(heap_number_map, mem);
        }
        Ok(allocation)
    }

    /// Allocate a tagged heap number holding `value`.
    pub fn allocate_heap_number_with_value(
        &mut self,
        result: Register,
        value: DoubleRegister,
        scratch1: Register,
        scratch2: Register,
        heap_number_map: Register,
        gc_required: Label,
    ) -> Result<Allocation, EmitError> {
        let allocation = self.allocate_heap_number(
            result,
            scratch1,
            scratch2,
            heap_number_map,
            gc_required,
            TaggingMode::TagResult,
            MutableMode::Immutable,
        )?;
        if allocation.is_inline() {
            let value_offset = self.layout.heap_number_value_offset();
            self.store_double(value, field_mem(result, value_offset));
        }
        Ok(allocation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::reg::{NO_REG, R2, R3, R4};
    use crate::asm::{Inst, WordWidth};
    use crate::config::EmitterConfig;

    #[test]
    fn test_allocate_rejects_missing_registers() {
        let mut m = MacroAssembler::new(EmitterConfig::default());
        let gc = m.new_label();
        let err = m.allocate(AllocSize::Imm(16), R2, NO_REG, R4, gc, AllocationFlags::TAG_OBJECT);
        assert_eq!(err.unwrap_err(), EmitError::InvalidRegister("allocate"));
        let err = m.allocate(AllocSize::Reg(NO_REG), R2, R3, R4, gc, AllocationFlags::NONE);
        assert_eq!(err.unwrap_err(), EmitError::InvalidRegister("allocate size"));
        assert!(m.insts().is_empty());
    }

    #[test]
    fn test_inline_new_disabled_always_branches() {
        let config = EmitterConfig::default().with_inline_new(false);
        let mut m = MacroAssembler::new(config);
        let gc = m.new_label();
        let out = m
            .allocate(AllocSize::Imm(16), R2, R3, R4, gc, AllocationFlags::TAG_OBJECT)
            .unwrap();
        assert_eq!(out, Allocation::AlwaysSlow);
        assert_eq!(m.insts(), &[Inst::Jump(crate::asm::Target::Label(gc))]);
    }

    #[test]
    fn test_poison_in_debug_code() {
        let config = EmitterConfig::default().with_inline_new(false).with_debug_code(true);
        let mut m = MacroAssembler::new(config);
        let gc = m.new_label();
        m.allocate(AllocSize::Imm(16), R2, R3, R4, gc, AllocationFlags::NONE).unwrap();
        assert_eq!(m.insts()[0], Inst::LoadImm { dst: R2, imm: 0x7091 });
        assert_eq!(m.insts()[1], Inst::LoadImm { dst: R4, imm: 0x7191 });
        assert_eq!(m.insts()[2], Inst::LoadImm { dst: R3, imm: 0x7291 });
    }

    #[test]
    fn test_aliasing_rejected() {
        let mut m = MacroAssembler::new(EmitterConfig::default());
        let gc = m.new_label();
        assert!(matches!(
            m.allocate(AllocSize::Imm(16), R2, R2, R4, gc, AllocationFlags::NONE),
            Err(EmitError::AliasedRegisters(_))
        ));
        assert!(m.allocate(AllocSize::Imm(16), R2, R3, regs::IP, gc, AllocationFlags::NONE).is_err());
    }

    #[test]
    fn test_size_register_may_be_result_end() {
        let mut m = MacroAssembler::new(EmitterConfig::default().with_width(WordWidth::W32));
        let gc = m.new_label();
        assert!(m.allocate(AllocSize::Reg(R3), R2, R3, R4, gc, AllocationFlags::NONE).is_ok());
        assert!(m
            .allocate(AllocSize::Reg(R3), R2, R3, R4, gc, AllocationFlags::DOUBLE_ALIGNMENT)
            .is_err());
    }

    #[test]
    fn test_misaligned_size_rejected() {
        let mut m = MacroAssembler::new(EmitterConfig::default());
        let gc = m.new_label();
        assert_eq!(
            m.allocate(AllocSize::Imm(12), R2, R3, R4, gc, AllocationFlags::NONE),
            Err(EmitError::MisalignedSize(12))
        );
        // Word counts are scaled before the check.
        assert!(m
            .allocate(AllocSize::Imm(3), R2, R3, R4, gc, AllocationFlags::SIZE_IN_WORDS)
            .is_ok());
    }

    #[test]
    fn test_top_is_stored_last_before_tagging() {
        let mut m = MacroAssembler::new(EmitterConfig::default());
        let gc = m.new_label();
        m.allocate(AllocSize::Imm(32), R2, R3, R4, gc, AllocationFlags::TAG_OBJECT).unwrap();
        let insts = m.insts();
        let store = insts.iter().position(|i| matches!(i, Inst::Store { .. })).unwrap();
        let branch = insts.iter().position(|i| matches!(i, Inst::Branch { .. })).unwrap();
        assert!(branch < store);
        assert_eq!(store, insts.len() - 2);
    }

    #[test]
    fn test_flags() {
        let flags = AllocationFlags::TAG_OBJECT | AllocationFlags::PRETENURE;
        assert!(flags.contains(AllocationFlags::TAG_OBJECT));
        assert!(flags.contains(AllocationFlags::PRETENURE));
        assert!(!flags.contains(AllocationFlags::SIZE_IN_WORDS));
    }
}
