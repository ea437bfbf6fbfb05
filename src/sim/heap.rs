//! Heap image of the simulator: spaces, roots, page headers, mark bitmaps
//! and object builders.

use super::{Simulator, addr};
use crate::error::SimError;
use crate::layout::{
    EMPTY_HASH_FIELD, ExternalRef, HEAP_OBJECT_TAG, RootIndex, instance_type, page_flags,
};
use crate::masm::MarkColor;

/// Bytes available in new space after setup.
pub const DEFAULT_NEW_SPACE_CAPACITY: u64 = 0x1_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Space {
    New,
    Old,
}

impl Space {
    fn top_ref(self) -> ExternalRef {
        match self {
            Space::New => ExternalRef::NewSpaceAllocationTop,
            Space::Old => ExternalRef::OldSpaceAllocationTop,
        }
    }

    fn limit_ref(self) -> ExternalRef {
        match self {
            Space::New => ExternalRef::NewSpaceAllocationLimit,
            Space::Old => ExternalRef::OldSpaceAllocationLimit,
        }
    }
}

fn tagged(address: u64) -> u64 {
    address + HEAP_OBJECT_TAG as u64
}

fn untagged(object: u64) -> u64 {
    object - HEAP_OBJECT_TAG as u64
}

impl Simulator {
    pub(crate) fn init_heap(&mut self, incremental_marking: bool) {
        let area_start = self.layout.object_area_start_offset() as u64;
        let page_size = 1u64 << self.layout.page_size_bits();

        let new_top = addr::NEW_SPACE + area_start;
        self.set_allocation_top(Space::New, new_top);
        self.set_allocation_limit(Space::New, new_top + DEFAULT_NEW_SPACE_CAPACITY);
        self.set_allocation_top(Space::Old, addr::OLD_SPACE + area_start);
        self.set_allocation_limit(Space::Old, addr::OLD_SPACE + page_size);
        let store_buffer_top = self.external(ExternalRef::StoreBufferTop);
        self.write_ptr(store_buffer_top, addr::STORE_BUFFER);

        self.set_page_flags(
            addr::NEW_SPACE,
            page_flags::POINTERS_TO_HERE_ARE_INTERESTING
                | page_flags::POINTERS_FROM_HERE_ARE_INTERESTING
                | page_flags::IN_TO_SPACE,
        );
        let mut old_flags = page_flags::POINTERS_FROM_HERE_ARE_INTERESTING;
        if incremental_marking {
            old_flags |= page_flags::POINTERS_TO_HERE_ARE_INTERESTING;
        }
        self.set_page_flags(addr::OLD_SPACE, old_flags);

        // The setup allocations are tiny; a full old page cannot fail them.
        let _ = self.init_roots();
    }

    fn init_roots(&mut self) -> Result<(), SimError> {
        let map_size = self.layout.map_size() as u64;
        let type_offset = self.layout.map_instance_type_offset();

        let meta_map = tagged(self.allocate_raw(Space::Old, map_size)?);
        self.write_field(meta_map, self.layout.map_offset(), meta_map);
        self.memory.write_u8(untagged(meta_map) + type_offset as u64, instance_type::MAP_TYPE);
        self.set_root(RootIndex::MetaMap, meta_map);

        for root in RootIndex::ALL {
            if root == RootIndex::MetaMap {
                continue;
            }
            let Some(ty) = root.map_instance_type() else { continue };
            let map = tagged(self.allocate_raw(Space::Old, map_size)?);
            self.write_field(map, self.layout.map_offset(), meta_map);
            self.memory.write_u8(untagged(map) + type_offset as u64, ty);
            self.set_root(root, map);
        }

        let ptr = self.ptr();
        for root in [
            RootIndex::UndefinedValue,
            RootIndex::NullValue,
            RootIndex::TheHoleValue,
            RootIndex::TrueValue,
            RootIndex::FalseValue,
        ] {
            let oddball = tagged(self.allocate_raw(Space::Old, 2 * ptr)?);
            self.set_root(root, oddball);
        }

        let empty = self.new_seq_string(Space::Old, true, 0)?;
        self.set_root(RootIndex::EmptyString, empty);
        Ok(())
    }

    // ==================== Roots ====================

    pub fn root(&self, index: RootIndex) -> u64 {
        self.read_ptr(addr::ROOTS + index.index() as u64 * self.ptr())
    }

    pub fn set_root(&mut self, index: RootIndex, value: u64) {
        let slot = addr::ROOTS + index.index() as u64 * self.ptr();
        self.write_ptr(slot, value);
    }

    // ==================== Spaces ====================

    pub fn allocation_top(&self, space: Space) -> u64 {
        self.read_ptr(self.external(space.top_ref()))
    }

    pub fn set_allocation_top(&mut self, space: Space, top: u64) {
        let cell = self.external(space.top_ref());
        self.write_ptr(cell, top);
    }

    pub fn allocation_limit(&self, space: Space) -> u64 {
        self.read_ptr(self.external(space.limit_ref()))
    }

    pub fn set_allocation_limit(&mut self, space: Space, limit: u64) {
        let cell = self.external(space.limit_ref());
        self.write_ptr(cell, limit);
    }

    /// Leave exactly `bytes` free in `space`.
    pub fn set_available(&mut self, space: Space, bytes: u64) {
        let top = self.allocation_top(space);
        self.set_allocation_limit(space, top + bytes);
    }

    pub fn in_new_space(&self, value: u64) -> bool {
        let mask = self.external(ExternalRef::NewSpaceMask);
        value & mask == addr::NEW_SPACE
    }

    /// Bump-allocate `size` bytes; returns the untagged address.
    pub fn allocate_raw(&mut self, space: Space, size: u64) -> Result<u64, SimError> {
        let align = self.layout.object_alignment_mask() as u64;
        let size = (size + align) & !align;
        let top = self.allocation_top(space);
        let limit = self.allocation_limit(space);
        if top + size > limit {
            return Err(SimError::Native {
                name: "allocate".to_string(),
                message: format!("{:?} space exhausted ({} bytes requested)", space, size),
            });
        }
        self.set_allocation_top(space, top + size);
        Ok(top)
    }

    // ==================== Objects ====================

    /// Read a pointer-sized field of a tagged object.
    pub fn read_field(&self, object: u64, offset: i32) -> u64 {
        self.read_ptr(untagged(object).wrapping_add(offset as i64 as u64))
    }

    pub fn write_field(&mut self, object: u64, offset: i32, value: u64) {
        let address = untagged(object).wrapping_add(offset as i64 as u64);
        self.write_ptr(address, value);
    }

    pub fn map_of(&self, object: u64) -> u64 {
        self.read_field(object, self.layout.map_offset())
    }

    pub fn instance_type_of(&self, object: u64) -> u8 {
        let map = self.map_of(object);
        self.memory.read_u8(untagged(map) + self.layout.map_instance_type_offset() as u64)
    }

    pub fn new_heap_number(&mut self, space: Space, value: f64) -> Result<u64, SimError> {
        let object = tagged(self.allocate_raw(space, self.layout.heap_number_size() as u64)?);
        let map = self.root(RootIndex::HeapNumberMap);
        self.write_field(object, self.layout.map_offset(), map);
        self.memory.write_f64(untagged(object) + self.layout.heap_number_value_offset() as u64, value);
        Ok(object)
    }

    pub fn heap_number_value(&self, object: u64) -> f64 {
        self.memory.read_f64(untagged(object) + self.layout.heap_number_value_offset() as u64)
    }

    /// A fixed array filled with undefined.
    pub fn new_fixed_array(&mut self, space: Space, length: usize) -> Result<u64, SimError> {
        let ptr = self.ptr();
        let header = self.layout.fixed_array_header_size() as u64;
        let object = tagged(self.allocate_raw(space, header + length as u64 * ptr)?);
        let map = self.root(RootIndex::FixedArrayMap);
        let undefined = self.root(RootIndex::UndefinedValue);
        self.write_field(object, self.layout.map_offset(), map);
        let length_bits = self.width.smi_bits(length as i64);
        self.write_field(object, self.layout.fixed_array_length_offset(), length_bits);
        for i in 0..length as u64 {
            self.write_ptr(untagged(object) + header + i * ptr, undefined);
        }
        Ok(object)
    }

    pub fn new_seq_string(&mut self, space: Space, one_byte: bool, length: usize) -> Result<u64, SimError> {
        let char_size = if one_byte { 1 } else { 2 };
        let size = self.layout.seq_string_header_size() as u64 + length as u64 * char_size;
        let object = tagged(self.allocate_raw(space, size)?);
        let map = self.root(if one_byte { RootIndex::OneByteStringMap } else { RootIndex::StringMap });
        self.write_field(object, self.layout.map_offset(), map);
        let length_bits = self.width.smi_bits(length as i64);
        self.write_field(object, self.layout.string_length_offset(), length_bits);
        self.write_field(object, self.layout.string_hash_field_offset(), EMPTY_HASH_FIELD as u64);
        Ok(object)
    }

    /// A function whose shared info declares `formal_parameter_count`
    /// (int32 on 64-bit targets, a Smi otherwise) and whose code starts at
    /// `code_entry`.
    pub fn new_js_function(&mut self, formal_parameter_count: i32, code_entry: u64) -> Result<u64, SimError> {
        let shared = tagged(self.allocate_raw(Space::Old, self.layout.shared_size() as u64)?);
        let shared_map = self.root(RootIndex::SharedFunctionInfoMap);
        self.write_field(shared, self.layout.map_offset(), shared_map);
        let count_address = untagged(shared) + self.layout.shared_formal_parameter_count_offset() as u64;
        if self.width.is_64bit() {
            self.memory.write_u32(count_address, formal_parameter_count as u32);
        } else {
            let bits = self.width.smi_bits(formal_parameter_count as i64);
            self.write_ptr(count_address, bits);
        }

        let context = self.new_fixed_array(Space::Old, 4)?;
        let function = tagged(self.allocate_raw(Space::Old, self.layout.js_function_size() as u64)?);
        let function_map = self.root(RootIndex::JsFunctionMap);
        let undefined = self.root(RootIndex::UndefinedValue);
        self.write_field(function, self.layout.map_offset(), function_map);
        self.write_field(function, self.layout.js_function_prototype_or_initial_map_offset(), undefined);
        self.write_field(function, self.layout.js_function_shared_offset(), shared);
        self.write_field(function, self.layout.js_function_context_offset(), context);
        self.write_field(function, self.layout.js_function_code_entry_offset(), code_entry);
        Ok(function)
    }

    // ==================== Pages ====================

    pub fn page_of(&self, address: u64) -> u64 {
        address & !((1u64 << self.layout.page_size_bits()) - 1)
    }

    pub fn page_flags(&self, address: u64) -> i64 {
        let page = self.page_of(address);
        self.read_ptr(page + self.layout.chunk_flags_offset() as u64) as i64
    }

    pub fn set_page_flags(&mut self, address: u64, flags: i64) {
        let page = self.page_of(address);
        self.write_ptr(page + self.layout.chunk_flags_offset() as u64, flags as u64);
    }

    pub fn live_bytes(&self, address: u64) -> u32 {
        let page = self.page_of(address);
        self.memory.read_u32(page + self.layout.chunk_live_bytes_offset() as u64)
    }

    /// Bitmap cell address and bit for the `which`th mark bit of `address`.
    fn mark_bit(&self, address: u64, which: u64) -> (u64, u32) {
        let page = self.page_of(address);
        let index = ((address - page) >> self.width.pointer_size_log2()) + which;
        let cell_bytes = 1u64 << self.layout.bitmap_bytes_per_cell_log2();
        let cell_bits = self.layout.bitmap_bits_per_cell_log2();
        let cell = page + self.layout.chunk_header_size() as u64 + (index >> cell_bits) * cell_bytes;
        (cell, (index & ((1 << cell_bits) - 1)) as u32)
    }

    fn mark_bit_set(&self, address: u64, which: u64) -> bool {
        let (cell, bit) = self.mark_bit(address, which);
        self.memory.read_u32(cell) & (1 << bit) != 0
    }

    fn write_mark_bit(&mut self, address: u64, which: u64, set: bool) {
        let (cell, bit) = self.mark_bit(address, which);
        let value = self.memory.read_u32(cell);
        let value = if set { value | (1 << bit) } else { value & !(1 << bit) };
        self.memory.write_u32(cell, value);
    }

    pub fn mark_color(&self, object: u64) -> MarkColor {
        MarkColor::from_bits(self.mark_bit_set(object, 0), self.mark_bit_set(object, 1))
    }

    pub fn set_mark_color(&mut self, object: u64, color: MarkColor) {
        let (first, second) = color.bits();
        self.write_mark_bit(object, 0, first == 1);
        self.write_mark_bit(object, 1, second == 1);
    }

    // ==================== Store buffer ====================

    pub(crate) fn append_to_store_buffer(&mut self, slot: u64) {
        let cell = self.external(ExternalRef::StoreBufferTop);
        let top = self.read_ptr(cell);
        self.write_ptr(top, slot);
        let ptr = self.ptr();
        self.write_ptr(cell, top + ptr);
    }

    /// Slots recorded in the store buffer, oldest first.
    pub fn store_buffer_entries(&self) -> Vec<u64> {
        let top = self.read_ptr(self.external(ExternalRef::StoreBufferTop));
        let ptr = self.ptr();
        (addr::STORE_BUFFER..top).step_by(ptr as usize).map(|slot| self.read_ptr(slot)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::{CodeBuffer, WordWidth};
    use crate::config::EmitterConfig;

    fn sim(width: WordWidth) -> Simulator {
        let code = CodeBuffer::new().finalize(width).unwrap();
        Simulator::new(code, &EmitterConfig::default().with_width(width))
    }

    #[test]
    fn test_roots_are_initialized() {
        for width in [WordWidth::W32, WordWidth::W64] {
            let sim = sim(width);
            let meta = sim.root(RootIndex::MetaMap);
            assert_eq!(sim.map_of(meta), meta);
            let number_map = sim.root(RootIndex::HeapNumberMap);
            assert_eq!(sim.map_of(number_map), meta);
            assert_ne!(sim.root(RootIndex::UndefinedValue), 0);
            let empty = sim.root(RootIndex::EmptyString);
            assert_eq!(sim.instance_type_of(empty), instance_type::ONE_BYTE_STRING_TYPE);
        }
    }

    #[test]
    fn test_new_space_membership() {
        let mut sim = sim(WordWidth::W64);
        let young = sim.new_heap_number(Space::New, 1.5).unwrap();
        let old = sim.new_heap_number(Space::Old, 2.5).unwrap();
        assert!(sim.in_new_space(young));
        assert!(!sim.in_new_space(old));
        assert_eq!(sim.heap_number_value(young), 1.5);
        assert_eq!(young & 3, 1);
    }

    #[test]
    fn test_allocation_exhaustion() {
        let mut sim = sim(WordWidth::W64);
        sim.set_available(Space::New, 16);
        assert!(sim.allocate_raw(Space::New, 16).is_ok());
        assert!(sim.allocate_raw(Space::New, 8).is_err());
    }

    #[test]
    fn test_mark_color_roundtrip_across_cells() {
        let mut sim = sim(WordWidth::W64);
        // The last bit of a cell: the second mark bit lands in the next one.
        let object = addr::OLD_SPACE + 0x8000 + 31 * 8 + 1;
        for color in [MarkColor::Black, MarkColor::Grey, MarkColor::White] {
            sim.set_mark_color(object, color);
            assert_eq!(sim.mark_color(object), color);
        }
        sim.set_mark_color(object, MarkColor::Grey);
        let (first_cell, bit) = sim.mark_bit(object, 0);
        let (second_cell, second_bit) = sim.mark_bit(object, 1);
        assert_eq!(bit, 31);
        assert_eq!(second_bit, 0);
        assert_eq!(second_cell, first_cell + 4);
    }

    #[test]
    fn test_page_flags_follow_marking() {
        let code = CodeBuffer::new().finalize(WordWidth::W64).unwrap();
        let marking = Simulator::new(code.clone(), &EmitterConfig::default());
        let idle = Simulator::new(code, &EmitterConfig::default().with_incremental_marking(false));
        let to_here = page_flags::POINTERS_TO_HERE_ARE_INTERESTING;
        assert_ne!(marking.page_flags(addr::OLD_SPACE + 0x9000) & to_here, 0);
        assert_eq!(idle.page_flags(addr::OLD_SPACE + 0x9000) & to_here, 0);
        assert_ne!(idle.page_flags(addr::NEW_SPACE + 0x9000) & page_flags::IN_TO_SPACE, 0);
    }

    #[test]
    fn test_function_formal_count_encoding() {
        let mut sim = sim(WordWidth::W32);
        let f = sim.new_js_function(3, addr::CODE_BASE).unwrap();
        let shared = sim.read_field(f, sim.layout().js_function_shared_offset());
        let raw = sim.read_field(shared, sim.layout().shared_formal_parameter_count_offset());
        assert_eq!(sim.width().smi_value(raw), 3);
    }
}
