//! Generational and incremental write barrier.
//!
//! A pointer store only needs recording when the value lives on a page
//! whose incoming pointers are interesting and the object lives on a page
//! whose outgoing pointers are interesting. Both facts are page flags, so
//! the inline part of the barrier is two flag tests followed by a call to
//! the RecordWrite stub.
//!
//! The mark bitmap holds two bits per pointer-sized word of a page, stored
//! after the page header in 32-bit cells:
//!
//! ```text
//!   white 00   black 10   grey 11   impossible 01
//! ```
//!
//! where the first bit is the one at the object's own index.

use super::{MacroAssembler, field_mem};
use crate::asm::reg::R0;
use crate::asm::{Cond, Label, MemOperand, Register, Stub, regs};
use crate::error::EmitError;
use crate::layout::{
    AbortReason, Counter, ExternalRef, RememberedSetAction, RootIndex,
    SaveFpRegsMode, ZAP_VALUE, instance_type, page_flags,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmiCheck {
    /// Skip the barrier when the value is a Smi
    Inline,
    /// The caller knows the value is a heap object
    Omit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRegisterStatus {
    HasNotBeenSaved,
    HasBeenSaved,
}

/// Whether the value's page still has to be tested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointersToHereCheck {
    MaybeInteresting,
    AlwaysInteresting,
}

/// What `remembered_set_helper` does once the slot is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RememberedSetFinalAction {
    ReturnAtEnd,
    FallThroughAtEnd,
}

/// Two-bit mark state of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkColor {
    White,
    Black,
    Grey,
    Impossible,
}

impl MarkColor {
    /// (first bit, second bit).
    pub fn bits(self) -> (u8, u8) {
        match self {
            MarkColor::White => (0, 0),
            MarkColor::Black => (1, 0),
            MarkColor::Grey => (1, 1),
            MarkColor::Impossible => (0, 1),
        }
    }

    pub fn from_bits(first: bool, second: bool) -> Self {
        match (first, second) {
            (false, false) => MarkColor::White,
            (true, false) => MarkColor::Black,
            (true, true) => MarkColor::Grey,
            (false, true) => MarkColor::Impossible,
        }
    }
}

fn eq_or_ne(op: &'static str, cond: Cond) -> Result<(), EmitError> {
    match cond {
        Cond::Eq | Cond::Ne => Ok(()),
        _ => Err(EmitError::Unsupported(op)),
    }
}

impl MacroAssembler {
    // ==================== Page flags ====================

    /// Branch to `condition_met` when `flags & mask` of the page holding
    /// `object` satisfies `cond` (Eq: all clear, Ne: some set). `scratch`
    /// may be `object`.
    pub fn check_page_flag(
        &mut self,
        object: Register,
        scratch: Register,
        mask: i64,
        cond: Cond,
        condition_met: Label,
    ) -> Result<(), EmitError> {
        eq_or_ne("check_page_flag condition must be eq or ne", cond)?;
        let page_bits = self.layout.page_size_bits();
        let flags_offset = self.layout.chunk_flags_offset();
        self.clear_right_imm(scratch, object, page_bits);

        if mask > 0 && (mask as u64).is_power_of_two() && mask <= u32::MAX as i64 {
            // A single flag only needs the byte that holds it.
            let (byte_offset, shifted_mask) = if mask <= 0x80 {
                (0, mask)
            } else if mask < 0x8000 {
                (1, mask >> 8)
            } else if mask < 0x80_0000 {
                (2, mask >> 16)
            } else {
                (3, mask >> 24)
            };
            self.load_logical_b(scratch, MemOperand::new(scratch, flags_offset + byte_offset));
            self.test_p(scratch, shifted_mask);
        } else {
            self.load_p(scratch, MemOperand::new(scratch, flags_offset));
            self.and_p(R0, scratch, mask);
        }
        self.branch(cond, condition_met);
        Ok(())
    }

    /// Branch when `object` is (Eq) or is not (Ne) in new space. Clobbers
    /// r0; `scratch` may be `object`.
    pub fn in_new_space(
        &mut self,
        object: Register,
        scratch: Register,
        cond: Cond,
        branch: Label,
    ) -> Result<(), EmitError> {
        eq_or_ne("in_new_space condition must be eq or ne", cond)?;
        self.mov_external(R0, ExternalRef::NewSpaceMask);
        self.and_p(scratch, object, R0);
        self.mov_external(R0, ExternalRef::NewSpaceStart);
        self.cmp_p(scratch, R0);
        self.branch(cond, branch);
        Ok(())
    }

    pub fn jump_if_in_new_space(&mut self, object: Register, scratch: Register, branch: Label) -> Result<(), EmitError> {
        self.in_new_space(object, scratch, Cond::Eq, branch)
    }

    pub fn jump_if_not_in_new_space(&mut self, object: Register, scratch: Register, branch: Label) -> Result<(), EmitError> {
        self.in_new_space(object, scratch, Cond::Ne, branch)
    }

    // ==================== Barriers ====================

    /// Write barrier for the field at `offset` of `object` that was just
    /// written with `value`. `dst` receives the slot address; `value` and
    /// `dst` are clobbered.
    #[allow(clippy::too_many_arguments)]
    pub fn record_write_field(
        &mut self,
        object: Register,
        offset: i32,
        value: Register,
        dst: Register,
        lr_status: LinkRegisterStatus,
        fp_mode: SaveFpRegsMode,
        remembered_set_action: RememberedSetAction,
        smi_check: SmiCheck,
        pointers_to_here_check: PointersToHereCheck,
    ) -> Result<(), EmitError> {
        if offset % self.ptr() != 0 {
            return Err(EmitError::MisalignedOffset(offset));
        }
        self.check_not_aliased("record_write_field", &[object, value, dst, regs::IP])?;
        let done = self.new_label();

        if smi_check == SmiCheck::Inline {
            self.jump_if_smi(value, done);
        }

        self.lay(dst, field_mem(object, offset));
        if self.emit_debug_code() {
            let align_mask = (self.ptr() - 1) as i64;
            self.and_p(R0, dst, align_mask);
            self.check(Cond::Eq, AbortReason::UnalignedCellInWriteBarrier);
        }

        self.record_write(
            object,
            dst,
            value,
            lr_status,
            fp_mode,
            remembered_set_action,
            SmiCheck::Omit,
            pointers_to_here_check,
        )?;

        self.bind(done);

        if self.emit_debug_code() {
            self.load_imm(value, ZAP_VALUE + 4);
            self.load_imm(dst, ZAP_VALUE + 8);
        }
        Ok(())
    }

    /// Write barrier for a map store into `object`. Never updates the
    /// remembered set since maps do not live in new space. `map` and `dst`
    /// are clobbered.
    pub fn record_write_for_map(
        &mut self,
        object: Register,
        map: Register,
        dst: Register,
        lr_status: LinkRegisterStatus,
        fp_mode: SaveFpRegsMode,
    ) -> Result<(), EmitError> {
        self.check_not_aliased("record_write_for_map", &[object, map, dst, regs::IP])?;
        let map_offset = self.layout.map_offset();
        if self.emit_debug_code() {
            self.load_p(dst, field_mem(map, map_offset));
            self.compare_root(dst, RootIndex::MetaMap);
            self.check(Cond::Eq, AbortReason::WrongAddressOrValuePassedToRecordWrite);
        }

        if !self.config.incremental_marking {
            return Ok(());
        }

        if self.emit_debug_code() {
            self.load_p(R0, field_mem(object, map_offset));
            self.cmp_p(map, R0);
            self.check(Cond::Eq, AbortReason::WrongAddressOrValuePassedToRecordWrite);
        }

        let done = self.new_label();
        // The map page flag is only set while marking, and then the object
        // page flag is set as well.
        self.check_page_flag(map, dst, page_flags::POINTERS_TO_HERE_ARE_INTERESTING, Cond::Eq, done)?;

        self.lay(dst, field_mem(object, map_offset));
        if self.emit_debug_code() {
            let align_mask = (self.ptr() - 1) as i64;
            self.and_p(R0, dst, align_mask);
            self.check(Cond::Eq, AbortReason::UnalignedCellInWriteBarrier);
        }

        self.call_record_write_stub(object, map, dst, RememberedSetAction::Omit, fp_mode, lr_status);
        self.increment_counter(Counter::WriteBarriersDynamic, 1, regs::IP, dst);
        self.bind(done);

        if self.emit_debug_code() {
            self.load_imm(dst, ZAP_VALUE + 12);
            self.load_imm(map, ZAP_VALUE + 16);
        }
        Ok(())
    }

    /// Record that `value` was stored into the slot at `address` inside
    /// `object`. `address`, `value` and ip are clobbered.
    #[allow(clippy::too_many_arguments)]
    pub fn record_write(
        &mut self,
        object: Register,
        address: Register,
        value: Register,
        lr_status: LinkRegisterStatus,
        fp_mode: SaveFpRegsMode,
        remembered_set_action: RememberedSetAction,
        smi_check: SmiCheck,
        pointers_to_here_check: PointersToHereCheck,
    ) -> Result<(), EmitError> {
        self.check_not_aliased("record_write", &[object, address, value, regs::IP])?;
        if self.emit_debug_code() {
            self.load_p(R0, MemOperand::new(address, 0));
            self.cmp_p(value, R0);
            self.check(Cond::Eq, AbortReason::WrongAddressOrValuePassedToRecordWrite);
        }

        if remembered_set_action == RememberedSetAction::Omit && !self.config.incremental_marking {
            self.trace(format_args!("record_write {}: nothing to record", object));
            return Ok(());
        }
        self.trace(format_args!(
            "record_write [{}] = {} in {} ({:?}, {:?})",
            address, value, object, remembered_set_action, smi_check
        ));

        let done = self.new_label();
        if smi_check == SmiCheck::Inline {
            self.jump_if_smi(value, done);
        }

        if pointers_to_here_check != PointersToHereCheck::AlwaysInteresting {
            self.check_page_flag(value, value, page_flags::POINTERS_TO_HERE_ARE_INTERESTING, Cond::Eq, done)?;
        }
        self.check_page_flag(object, value, page_flags::POINTERS_FROM_HERE_ARE_INTERESTING, Cond::Eq, done)?;

        self.call_record_write_stub(object, value, address, remembered_set_action, fp_mode, lr_status);
        self.increment_counter(Counter::WriteBarriersDynamic, 1, regs::IP, value);
        self.bind(done);

        if self.emit_debug_code() {
            self.load_imm(address, ZAP_VALUE + 12);
            self.load_imm(value, ZAP_VALUE + 16);
        }
        Ok(())
    }

    fn call_record_write_stub(
        &mut self,
        object: Register,
        value: Register,
        address: Register,
        remembered_set_action: RememberedSetAction,
        fp_mode: SaveFpRegsMode,
        lr_status: LinkRegisterStatus,
    ) {
        if lr_status == LinkRegisterStatus::HasNotBeenSaved {
            self.push(regs::LR);
        }
        self.call_stub(Stub::RecordWrite { object, value, address, remembered_set_action, fp_mode });
        if lr_status == LinkRegisterStatus::HasNotBeenSaved {
            self.pop(regs::LR);
        }
        self.stats.write_barriers_static += 1;
    }

    /// Append `address` to the store buffer and flush it when full.
    /// Clobbers `scratch` and ip.
    pub fn remembered_set_helper(
        &mut self,
        object: Register,
        address: Register,
        scratch: Register,
        fp_mode: SaveFpRegsMode,
        and_then: RememberedSetFinalAction,
    ) -> Result<(), EmitError> {
        self.check_not_aliased("remembered_set_helper", &[address, scratch, regs::IP])?;
        if self.emit_debug_code() {
            let ok = self.new_label();
            self.jump_if_not_in_new_space(object, scratch, ok)?;
            self.abort(AbortReason::RememberedSetPointerInNewSpace);
            self.bind(ok);
        }

        let done = self.new_label();
        let ptr = self.ptr();
        self.mov_external(regs::IP, ExternalRef::StoreBufferTop);
        self.load_p(scratch, MemOperand::new(regs::IP, 0));
        self.store_p(address, MemOperand::new(scratch, 0));
        self.add_p(scratch, scratch, ptr);
        self.store_p(scratch, MemOperand::new(regs::IP, 0));

        let overflow_bit = self.layout.store_buffer_overflow_bit();
        self.test_p(scratch, overflow_bit);
        self.branch(Cond::Eq, done);
        self.push(regs::LR);
        self.call_stub(Stub::StoreBufferOverflow { fp_mode });
        self.pop(regs::LR);
        self.bind(done);
        if and_then == RememberedSetFinalAction::ReturnAtEnd {
            self.ret();
        }
        Ok(())
    }

    // ==================== Mark bits ====================

    /// Compute the bitmap cell address (minus the page header size) into
    /// `bitmap` and the bit of `addr` within that cell into `mask`.
    /// Clobbers ip.
    pub fn get_mark_bits(&mut self, addr: Register, bitmap: Register, mask: Register) -> Result<(), EmitError> {
        self.check_not_aliased("get_mark_bits", &[addr, bitmap, mask, regs::IP])?;
        let log2 = self.width().pointer_size_log2();
        let low_bits = log2 + self.layout.bitmap_bits_per_cell_log2();
        let page_bits = self.layout.page_size_bits();
        let bytes_per_cell_log2 = self.layout.bitmap_bytes_per_cell_log2();

        self.clear_right_imm(bitmap, addr, page_bits);
        self.extract_bit_range(mask, addr, low_bits - 1, log2);
        self.extract_bit_range(regs::IP, addr, page_bits - 1, low_bits);
        self.shift_left_p(regs::IP, regs::IP, bytes_per_cell_log2 as i64);
        self.add_p(bitmap, bitmap, regs::IP);
        self.mov(regs::IP, mask);
        self.load_imm(mask, 1);
        self.shift_left_p(mask, mask, regs::IP);
        Ok(())
    }

    /// Branch to `has_color` when the mark bits of `object` are `color`.
    /// The second bit may live in the next bitmap cell.
    pub fn has_color(
        &mut self,
        object: Register,
        bitmap_scratch: Register,
        mask_scratch: Register,
        has_color: Label,
        color: MarkColor,
    ) -> Result<(), EmitError> {
        self.get_mark_bits(object, bitmap_scratch, mask_scratch)?;
        let (first_bit, second_bit) = color.bits();
        let header = self.layout.chunk_header_size();

        let other_color = self.new_label();
        let word_boundary = self.new_label();
        self.load_logical_w(regs::IP, MemOperand::new(bitmap_scratch, header));
        self.and_p(R0, regs::IP, mask_scratch);
        self.branch(if first_bit == 1 { Cond::Eq } else { Cond::Ne }, other_color);
        self.shift_left_32(mask_scratch, mask_scratch, 1i64);
        self.branch(Cond::Eq, word_boundary);
        self.and_p(R0, regs::IP, mask_scratch);
        self.branch(if second_bit == 1 { Cond::Ne } else { Cond::Eq }, has_color);
        self.b(other_color);

        self.bind(word_boundary);
        self.load_logical_w(regs::IP, MemOperand::new(bitmap_scratch, header + 4));
        self.and_p(R0, regs::IP, 1i64);
        self.branch(if second_bit == 1 { Cond::Ne } else { Cond::Eq }, has_color);
        self.bind(other_color);
        Ok(())
    }

    pub fn jump_if_black(
        &mut self,
        object: Register,
        scratch0: Register,
        scratch1: Register,
        on_black: Label,
    ) -> Result<(), EmitError> {
        self.has_color(object, scratch0, scratch1, on_black, MarkColor::Black)
    }

    /// Jump to `not_data_object` unless `value` is a heap number or a
    /// non-indirect string, i.e. an object without outgoing pointers.
    pub fn jump_if_data_object(&mut self, value: Register, scratch: Register, not_data_object: Label) {
        let is_data_object = self.new_label();
        let map_offset = self.layout.map_offset();
        let type_offset = self.layout.map_instance_type_offset();
        self.load_p(scratch, field_mem(value, map_offset));
        self.compare_root(scratch, RootIndex::HeapNumberMap);
        self.branch(Cond::Eq, is_data_object);
        self.load_logical_b(scratch, field_mem(scratch, type_offset));
        self.and_p(
            scratch,
            scratch,
            instance_type::IS_INDIRECT_STRING_MASK | instance_type::IS_NOT_STRING_MASK,
        );
        self.branch(Cond::Ne, not_data_object);
        self.bind(is_data_object);
    }

    /// Make sure a white `value` is marked. Data objects are blackened in
    /// place and their size is added to the page's live bytes; any other
    /// white object branches to `value_is_white_and_not_data`.
    pub fn ensure_not_white(
        &mut self,
        value: Register,
        bitmap_scratch: Register,
        mask_scratch: Register,
        load_scratch: Register,
        value_is_white_and_not_data: Label,
    ) -> Result<(), EmitError> {
        self.check_not_aliased(
            "ensure_not_white",
            &[value, bitmap_scratch, mask_scratch, load_scratch, regs::IP],
        )?;
        self.get_mark_bits(value, bitmap_scratch, mask_scratch)?;
        let header = self.layout.chunk_header_size();
        let done = self.new_label();

        // Black and grey both have the first bit set.
        self.load_logical_w(load_scratch, MemOperand::new(bitmap_scratch, header));
        self.and_p(R0, load_scratch, mask_scratch);
        self.branch(Cond::Ne, done);

        if self.emit_debug_code() {
            // A carry out of the cell makes this check conservative.
            self.shift_left_32(R0, mask_scratch, 1i64);
            self.and_p(R0, R0, load_scratch);
            self.check(Cond::Eq, AbortReason::ImpossibleMarkingBitPattern);
        }

        let map = load_scratch;
        let length = load_scratch;
        let instance_type = load_scratch;
        let is_data_object = self.new_label();
        let maybe_string_object = self.new_label();
        let is_string_object = self.new_label();
        let is_encoded = self.new_label();
        let length_computed = self.new_label();

        let map_offset = self.layout.map_offset();
        self.load_p(map, field_mem(value, map_offset));
        self.compare_root(map, RootIndex::HeapNumberMap);
        self.branch(Cond::Ne, maybe_string_object);
        let heap_number_size = self.layout.heap_number_size();
        self.load_imm(length, heap_number_size as i64);
        self.b(is_data_object);

        self.bind(maybe_string_object);
        let type_offset = self.layout.map_instance_type_offset();
        self.load_logical_b(instance_type, field_mem(map, type_offset));
        self.and_p(
            R0,
            instance_type,
            instance_type::IS_INDIRECT_STRING_MASK | instance_type::IS_NOT_STRING_MASK,
        );
        self.branch(Cond::Ne, value_is_white_and_not_data);
        self.and_p(R0, instance_type, instance_type::EXTERNAL_STRING_TAG);
        self.branch(Cond::Eq, is_string_object);
        let external_size = self.layout.external_string_size();
        self.load_imm(length, external_size as i64);
        self.b(is_data_object);

        // Sequential string: header plus length times the char size.
        self.bind(is_string_object);
        let length_offset = self.layout.string_length_offset();
        self.load_p(regs::IP, field_mem(value, length_offset));
        self.and_p(R0, instance_type, instance_type::STRING_ENCODING_MASK);
        self.branch(Cond::Eq, is_encoded);
        self.smi_untag(regs::IP, regs::IP);
        self.b(length_computed);
        self.bind(is_encoded);
        self.smi_to_short_array_offset(regs::IP, regs::IP);
        self.bind(length_computed);
        let align_mask = self.layout.object_alignment_mask();
        let seq_header = self.layout.seq_string_header_size() as i64;
        self.add_p(length, regs::IP, seq_header + align_mask);
        self.and_p(length, length, !align_mask);

        // White to black only needs the first bit.
        self.bind(is_data_object);
        self.load_logical_w(regs::IP, MemOperand::new(bitmap_scratch, header));
        self.or_p(regs::IP, regs::IP, mask_scratch);
        self.store_w(regs::IP, MemOperand::new(bitmap_scratch, header));

        let page_bits = self.layout.page_size_bits();
        let live_bytes = self.layout.chunk_live_bytes_offset();
        self.clear_right_imm(bitmap_scratch, bitmap_scratch, page_bits);
        self.load_logical_w(regs::IP, MemOperand::new(bitmap_scratch, live_bytes));
        self.add_p(regs::IP, regs::IP, length);
        self.store_w(regs::IP, MemOperand::new(bitmap_scratch, live_bytes));

        self.bind(done);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::reg::{R2, R3, R4, R5};
    use crate::asm::{Inst, Target};
    use crate::config::EmitterConfig;

    fn masm() -> MacroAssembler {
        MacroAssembler::new(EmitterConfig::default())
    }

    fn stub_calls(m: &MacroAssembler) -> usize {
        m.insts()
            .iter()
            .filter(|i| matches!(i, Inst::Call(Target::Stub(Stub::RecordWrite { .. }))))
            .count()
    }

    #[test]
    fn test_mark_color_bits() {
        for color in [MarkColor::White, MarkColor::Black, MarkColor::Grey, MarkColor::Impossible] {
            let (first, second) = color.bits();
            assert_eq!(MarkColor::from_bits(first == 1, second == 1), color);
        }
        assert_eq!(MarkColor::Black.bits(), (1, 0));
    }

    #[test]
    fn test_record_write_rejects_object_as_value() {
        let mut m = masm();
        let err = m
            .record_write(
                R2,
                R3,
                R2,
                LinkRegisterStatus::HasNotBeenSaved,
                SaveFpRegsMode::DontSave,
                RememberedSetAction::Emit,
                SmiCheck::Inline,
                PointersToHereCheck::MaybeInteresting,
            )
            .unwrap_err();
        assert!(matches!(err, EmitError::AliasedRegisters(_)));
    }

    #[test]
    fn test_omit_without_marking_emits_nothing() {
        let mut m = MacroAssembler::new(EmitterConfig::default().with_incremental_marking(false));
        m.record_write(
            R2,
            R3,
            R4,
            LinkRegisterStatus::HasNotBeenSaved,
            SaveFpRegsMode::DontSave,
            RememberedSetAction::Omit,
            SmiCheck::Inline,
            PointersToHereCheck::MaybeInteresting,
        )
        .unwrap();
        assert!(m.insts().is_empty());
        assert_eq!(m.stats().write_barriers_static, 0);
    }

    #[test]
    fn test_link_register_saved_around_stub() {
        let mut m = masm();
        m.record_write(
            R2,
            R3,
            R4,
            LinkRegisterStatus::HasNotBeenSaved,
            SaveFpRegsMode::DontSave,
            RememberedSetAction::Emit,
            SmiCheck::Inline,
            PointersToHereCheck::MaybeInteresting,
        )
        .unwrap();
        let insts = m.insts();
        let call = insts.iter().position(|i| i.is_call()).unwrap();
        assert!(matches!(insts[call - 1], Inst::Store { src: regs::LR, .. }));
        assert!(matches!(insts[call + 1], Inst::Load { dst: regs::LR, .. }));
        assert_eq!(stub_calls(&m), 1);
        assert_eq!(m.stats().write_barriers_static, 1);
    }

    #[test]
    fn test_always_interesting_skips_value_page_check() {
        let count_flag_loads = |check| {
            let mut m = masm();
            m.record_write(
                R2,
                R3,
                R4,
                LinkRegisterStatus::HasBeenSaved,
                SaveFpRegsMode::DontSave,
                RememberedSetAction::Emit,
                SmiCheck::Omit,
                check,
            )
            .unwrap();
            m.insts().iter().filter(|i| matches!(i, Inst::Load { .. })).count()
        };
        assert_eq!(
            count_flag_loads(PointersToHereCheck::MaybeInteresting),
            count_flag_loads(PointersToHereCheck::AlwaysInteresting) + 1
        );
    }

    #[test]
    fn test_record_write_field_offset_alignment() {
        let mut m = masm();
        let err = m
            .record_write_field(
                R2,
                12,
                R4,
                R5,
                LinkRegisterStatus::HasNotBeenSaved,
                SaveFpRegsMode::DontSave,
                RememberedSetAction::Emit,
                SmiCheck::Inline,
                PointersToHereCheck::MaybeInteresting,
            )
            .unwrap_err();
        assert_eq!(err, EmitError::MisalignedOffset(12));
    }

    #[test]
    fn test_record_write_for_map_skipped_without_marking() {
        let mut m = MacroAssembler::new(EmitterConfig::default().with_incremental_marking(false));
        m.record_write_for_map(R2, R3, R4, LinkRegisterStatus::HasNotBeenSaved, SaveFpRegsMode::DontSave)
            .unwrap();
        assert!(m.insts().is_empty());

        let mut m = masm();
        m.record_write_for_map(R2, R3, R4, LinkRegisterStatus::HasNotBeenSaved, SaveFpRegsMode::DontSave)
            .unwrap();
        match m.insts().iter().find_map(|i| match i {
            Inst::Call(Target::Stub(s)) => Some(*s),
            _ => None,
        }) {
            Some(Stub::RecordWrite { remembered_set_action, .. }) => {
                assert_eq!(remembered_set_action, RememberedSetAction::Omit)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_check_page_flag_single_byte() {
        let mut m = masm();
        let l = m.new_label();
        m.check_page_flag(R2, R3, page_flags::POINTERS_FROM_HERE_ARE_INTERESTING, Cond::Eq, l)
            .unwrap();
        assert!(m.insts().iter().any(|i| matches!(i, Inst::Load { ty: crate::asm::MemType::U8, .. })));
        assert!(m.check_page_flag(R2, R3, 4, Cond::Lt, l).is_err());
    }

    #[test]
    fn test_in_new_space_condition() {
        let mut m = masm();
        let l = m.new_label();
        assert!(m.jump_if_in_new_space(R2, R3, l).is_ok());
        assert_eq!(m.in_new_space(R2, R3, Cond::Gt, l), Err(EmitError::Unsupported("in_new_space condition must be eq or ne")));
    }

    #[test]
    fn test_ensure_not_white_aliasing() {
        let mut m = masm();
        let l = m.new_label();
        assert!(m.ensure_not_white(R2, R3, R4, R3, l).is_err());
        assert!(m.ensure_not_white(R2, R3, R4, regs::IP, l).is_err());
        assert!(m.ensure_not_white(R2, R3, R4, R5, l).is_ok());
    }
}
