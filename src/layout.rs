//! Heap layout constants and the contracts with the rest of the runtime.
//!
//! None of these values are computed by the emitters; they are the fixed
//! view of object shapes, pages and external cells the emitted code relies on.
//! Offsets scale with the pointer width.

use std::fmt;

use crate::asm::WordWidth;

pub const HEAP_OBJECT_TAG: i32 = 1;
pub const HEAP_OBJECT_TAG_MASK: i64 = 3;
pub const SMI_TAG: i64 = 0;
pub const SMI_TAG_MASK: i64 = 1;

/// Expected-count value for functions that accept any number of arguments.
pub const DONT_ADAPT_ARGUMENTS_SENTINEL: i32 = -1;

/// Hash field of a freshly allocated string.
pub const EMPTY_HASH_FIELD: i64 = 3;

/// Debug poison written to allocation registers when inline allocation is off.
pub const ALLOCATION_POISON: [i64; 3] = [0x7091, 0x7191, 0x7291];
/// Base of the debug poison written to registers clobbered by a write barrier.
pub const ZAP_VALUE: i64 = 0xdead_beef;

/// Exponent mask of the high word of a double, and its shift.
pub const DOUBLE_EXPONENT_MASK: i64 = 0x7ff0_0000;
pub const DOUBLE_EXPONENT_SHIFT: u32 = 20;
pub const DOUBLE_EXPONENT_ALL_ONES: i64 = 0x7ff;
pub const MINUS_ZERO_BITS: u64 = 0x8000_0000_0000_0000;

/// Instance type encoding.
pub mod instance_type {
    pub const IS_NOT_STRING_MASK: i64 = 0x80;
    pub const STRING_REPRESENTATION_MASK: i64 = 0x03;
    pub const SEQ_STRING_TAG: i64 = 0x00;
    pub const CONS_STRING_TAG: i64 = 0x01;
    pub const EXTERNAL_STRING_TAG: i64 = 0x02;
    pub const SLICED_STRING_TAG: i64 = 0x03;
    pub const IS_INDIRECT_STRING_MASK: i64 = 0x01;
    pub const STRING_ENCODING_MASK: i64 = 0x04;
    pub const ONE_BYTE_STRING_TAG: i64 = 0x04;
    pub const TWO_BYTE_STRING_TAG: i64 = 0x00;
    pub const IS_NOT_INTERNALIZED_MASK: i64 = 0x40;

    pub const STRING_TYPE: u8 = 0x40;
    pub const ONE_BYTE_STRING_TYPE: u8 = 0x44;
    pub const CONS_STRING_TYPE: u8 = 0x41;
    pub const CONS_ONE_BYTE_STRING_TYPE: u8 = 0x45;
    pub const EXTERNAL_STRING_TYPE: u8 = 0x42;
    pub const EXTERNAL_ONE_BYTE_STRING_TYPE: u8 = 0x46;
    pub const SLICED_STRING_TYPE: u8 = 0x43;
    pub const SLICED_ONE_BYTE_STRING_TYPE: u8 = 0x47;
    pub const FIRST_NONSTRING_TYPE: u8 = 0x80;
    pub const SYMBOL_TYPE: u8 = 0x80;
    pub const LAST_NAME_TYPE: u8 = 0x80;
    pub const HEAP_NUMBER_TYPE: u8 = 0x81;
    pub const MUTABLE_HEAP_NUMBER_TYPE: u8 = 0x82;
    pub const ODDBALL_TYPE: u8 = 0x83;
    pub const MAP_TYPE: u8 = 0x84;
    pub const FILLER_TYPE: u8 = 0x85;
    pub const FIXED_ARRAY_TYPE: u8 = 0x86;
    pub const FIXED_DOUBLE_ARRAY_TYPE: u8 = 0x87;
    pub const ALLOCATION_SITE_TYPE: u8 = 0x88;
    pub const JS_OBJECT_TYPE: u8 = 0xb0;
    pub const JS_FUNCTION_TYPE: u8 = 0xb1;
}

/// Memory chunk flag bits.
pub mod page_flags {
    pub const POINTERS_TO_HERE_ARE_INTERESTING: i64 = 1 << 1;
    pub const POINTERS_FROM_HERE_ARE_INTERESTING: i64 = 1 << 2;
    pub const IN_FROM_SPACE: i64 = 1 << 3;
    pub const IN_TO_SPACE: i64 = 1 << 4;
}

/// Object, page and frame layout for one pointer width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapLayout {
    width: WordWidth,
}

impl HeapLayout {
    pub fn new(width: WordWidth) -> Self {
        Self { width }
    }

    pub fn width(&self) -> WordWidth {
        self.width
    }

    fn p(&self, slots: i32) -> i32 {
        slots * self.width.pointer_size()
    }

    // ====== Objects ======

    pub fn map_offset(&self) -> i32 {
        0
    }

    pub fn object_alignment(&self) -> i64 {
        self.width.pointer_size() as i64
    }

    pub fn object_alignment_mask(&self) -> i64 {
        self.object_alignment() - 1
    }

    pub fn double_alignment_mask(&self) -> i64 {
        WordWidth::DOUBLE_SIZE as i64 - 1
    }

    pub fn heap_number_value_offset(&self) -> i32 {
        self.p(1)
    }

    pub fn heap_number_size(&self) -> i32 {
        self.p(1) + WordWidth::DOUBLE_SIZE
    }

    pub fn string_length_offset(&self) -> i32 {
        self.p(1)
    }

    pub fn string_hash_field_offset(&self) -> i32 {
        self.p(2)
    }

    pub fn seq_string_header_size(&self) -> i32 {
        self.p(3)
    }

    pub fn cons_string_size(&self) -> i32 {
        self.p(5)
    }

    pub fn sliced_string_size(&self) -> i32 {
        self.p(5)
    }

    pub fn external_string_size(&self) -> i32 {
        self.p(4)
    }

    pub fn fixed_array_length_offset(&self) -> i32 {
        self.p(1)
    }

    pub fn fixed_array_header_size(&self) -> i32 {
        self.p(2)
    }

    pub fn map_instance_type_offset(&self) -> i32 {
        self.p(1)
    }

    pub fn map_bit_field2_offset(&self) -> i32 {
        self.p(1) + 2
    }

    pub fn map_size(&self) -> i32 {
        self.p(4)
    }

    pub fn js_function_prototype_or_initial_map_offset(&self) -> i32 {
        self.p(3)
    }

    pub fn js_function_shared_offset(&self) -> i32 {
        self.p(4)
    }

    pub fn js_function_context_offset(&self) -> i32 {
        self.p(5)
    }

    pub fn js_function_code_entry_offset(&self) -> i32 {
        self.p(6)
    }

    pub fn js_function_size(&self) -> i32 {
        self.p(7)
    }

    /// Formal parameter count inside a shared function info: an int32 field
    /// on 64-bit targets, a Smi on 32-bit targets.
    pub fn shared_formal_parameter_count_offset(&self) -> i32 {
        self.p(2)
    }

    pub fn shared_size(&self) -> i32 {
        self.p(4)
    }

    /// Offset of a context slot from the untagged context start.
    pub fn context_slot_offset(&self, index: i32) -> i32 {
        self.fixed_array_header_size() + self.p(index)
    }

    pub const CONTEXT_PREVIOUS_INDEX: i32 = 1;

    // ====== Pages ======

    pub fn page_size_bits(&self) -> u32 {
        19
    }

    pub fn page_alignment_mask(&self) -> i64 {
        (1 << self.page_size_bits()) - 1
    }

    pub fn chunk_flags_offset(&self) -> i32 {
        self.p(1)
    }

    pub fn chunk_live_bytes_offset(&self) -> i32 {
        self.p(3)
    }

    /// Start of the marking bitmap inside the chunk header.
    pub fn chunk_header_size(&self) -> i32 {
        self.p(4)
    }

    /// Where objects start on a page.
    pub fn object_area_start_offset(&self) -> i32 {
        0x8000
    }

    pub fn bitmap_bits_per_cell_log2(&self) -> u32 {
        5
    }

    pub fn bitmap_bytes_per_cell_log2(&self) -> u32 {
        2
    }

    pub fn store_buffer_overflow_bit(&self) -> i64 {
        1 << (14 + self.width.pointer_size_log2())
    }

    // ====== Frames ======

    pub fn caller_fp_offset(&self) -> i32 {
        0
    }

    pub fn caller_pc_offset(&self) -> i32 {
        self.p(1)
    }

    pub fn caller_sp_offset(&self) -> i32 {
        self.p(2)
    }

    pub fn context_offset(&self) -> i32 {
        -self.p(1)
    }

    /// Frame type marker, or the function in JavaScript frames.
    pub fn marker_offset(&self) -> i32 {
        -self.p(2)
    }

    pub fn fixed_frame_size_from_fp(&self) -> i32 {
        self.p(2)
    }

    pub fn exit_frame_sp_offset(&self) -> i32 {
        -self.p(1)
    }

    pub fn exit_frame_code_offset(&self) -> i32 {
        -self.p(2)
    }

    pub fn exit_frame_size(&self) -> i32 {
        self.p(2)
    }

    /// Slots the native ABI requires below the stack pointer at a call.
    pub fn required_stack_frame_slots(&self) -> i32 {
        match self.width {
            WordWidth::W32 => 24,
            WordWidth::W64 => 20,
        }
    }

    /// Slot of the required area the exit frame's sp record points at.
    pub fn stack_frame_sp_slot(&self) -> i32 {
        15
    }
}

/// Frame kinds; the marker is stored as a Smi in the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    None = 0,
    Exit = 1,
    Stub = 2,
    Internal = 3,
    Manual = 4,
    JavaScript = 5,
}

/// Entries of the roots table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RootIndex {
    UndefinedValue = 0,
    NullValue,
    TheHoleValue,
    TrueValue,
    FalseValue,
    EmptyString,
    MetaMap,
    HeapNumberMap,
    MutableHeapNumberMap,
    OnePointerFillerMap,
    TwoPointerFillerMap,
    FixedArrayMap,
    FixedDoubleArrayMap,
    FixedCowArrayMap,
    StringMap,
    OneByteStringMap,
    ConsStringMap,
    ConsOneByteStringMap,
    SlicedStringMap,
    SlicedOneByteStringMap,
    ExternalStringMap,
    ExternalOneByteStringMap,
    AllocationSiteMap,
    JsFunctionMap,
    SharedFunctionInfoMap,
}

impl RootIndex {
    pub const COUNT: usize = 25;

    pub const ALL: [RootIndex; Self::COUNT] = [
        RootIndex::UndefinedValue,
        RootIndex::NullValue,
        RootIndex::TheHoleValue,
        RootIndex::TrueValue,
        RootIndex::FalseValue,
        RootIndex::EmptyString,
        RootIndex::MetaMap,
        RootIndex::HeapNumberMap,
        RootIndex::MutableHeapNumberMap,
        RootIndex::OnePointerFillerMap,
        RootIndex::TwoPointerFillerMap,
        RootIndex::FixedArrayMap,
        RootIndex::FixedDoubleArrayMap,
        RootIndex::FixedCowArrayMap,
        RootIndex::StringMap,
        RootIndex::OneByteStringMap,
        RootIndex::ConsStringMap,
        RootIndex::ConsOneByteStringMap,
        RootIndex::SlicedStringMap,
        RootIndex::SlicedOneByteStringMap,
        RootIndex::ExternalStringMap,
        RootIndex::ExternalOneByteStringMap,
        RootIndex::AllocationSiteMap,
        RootIndex::JsFunctionMap,
        RootIndex::SharedFunctionInfoMap,
    ];

    pub fn index(self) -> i32 {
        self as i32
    }

    /// Instance type of the objects this root map describes, for map roots.
    pub fn map_instance_type(self) -> Option<u8> {
        use instance_type::*;
        Some(match self {
            RootIndex::MetaMap => MAP_TYPE,
            RootIndex::HeapNumberMap => HEAP_NUMBER_TYPE,
            RootIndex::MutableHeapNumberMap => MUTABLE_HEAP_NUMBER_TYPE,
            RootIndex::OnePointerFillerMap | RootIndex::TwoPointerFillerMap => FILLER_TYPE,
            RootIndex::FixedArrayMap | RootIndex::FixedCowArrayMap => FIXED_ARRAY_TYPE,
            RootIndex::FixedDoubleArrayMap => FIXED_DOUBLE_ARRAY_TYPE,
            RootIndex::StringMap => STRING_TYPE,
            RootIndex::OneByteStringMap => ONE_BYTE_STRING_TYPE,
            RootIndex::ConsStringMap => CONS_STRING_TYPE,
            RootIndex::ConsOneByteStringMap => CONS_ONE_BYTE_STRING_TYPE,
            RootIndex::SlicedStringMap => SLICED_STRING_TYPE,
            RootIndex::SlicedOneByteStringMap => SLICED_ONE_BYTE_STRING_TYPE,
            RootIndex::ExternalStringMap => EXTERNAL_STRING_TYPE,
            RootIndex::ExternalOneByteStringMap => EXTERNAL_ONE_BYTE_STRING_TYPE,
            RootIndex::AllocationSiteMap => ALLOCATION_SITE_TYPE,
            RootIndex::JsFunctionMap => JS_FUNCTION_TYPE,
            RootIndex::SharedFunctionInfoMap => JS_OBJECT_TYPE,
            _ => return None,
        })
    }

    /// Whether emitted code may overwrite this root.
    pub fn can_be_written_after_initialization(self) -> bool {
        matches!(self, RootIndex::EmptyString)
    }
}

/// Native statistics counters (32-bit cells).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    WriteBarriersDynamic,
    /// A general purpose counter slot for callers of the emitter.
    Slot(u8),
}

impl Counter {
    pub fn slot(self) -> i32 {
        match self {
            Counter::WriteBarriersDynamic => 0,
            Counter::Slot(n) => 1 + n as i32,
        }
    }
}

/// Runtime functions reachable through the CEntry stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeFunction {
    Abort,
    AllocateInNewSpace,
    AllocateInTargetSpace,
    StackGuard,
    NumberToString,
}

impl RuntimeFunction {
    pub const ALL: [RuntimeFunction; 5] = [
        RuntimeFunction::Abort,
        RuntimeFunction::AllocateInNewSpace,
        RuntimeFunction::AllocateInTargetSpace,
        RuntimeFunction::StackGuard,
        RuntimeFunction::NumberToString,
    ];

    pub fn id(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            RuntimeFunction::Abort => "Abort",
            RuntimeFunction::AllocateInNewSpace => "AllocateInNewSpace",
            RuntimeFunction::AllocateInTargetSpace => "AllocateInTargetSpace",
            RuntimeFunction::StackGuard => "StackGuard",
            RuntimeFunction::NumberToString => "NumberToString",
        }
    }

    /// Fixed argument count, or -1 when variadic.
    pub fn nargs(self) -> i32 {
        match self {
            RuntimeFunction::Abort => 1,
            RuntimeFunction::AllocateInNewSpace => 1,
            RuntimeFunction::AllocateInTargetSpace => 2,
            RuntimeFunction::StackGuard => 0,
            RuntimeFunction::NumberToString => 1,
        }
    }

    pub fn result_size(self) -> u8 {
        1
    }
}

/// Addresses (or, for masks, values) supplied by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExternalRef {
    NewSpaceAllocationTop,
    NewSpaceAllocationLimit,
    OldSpaceAllocationTop,
    OldSpaceAllocationLimit,
    /// Frame pointer of the innermost exit frame
    CEntryFp,
    /// Context saved across an exit frame
    Context,
    StoreBufferTop,
    NewSpaceStart,
    NewSpaceMask,
    /// The code object being generated
    CodeObject,
    Counter(Counter),
    Runtime(RuntimeFunction),
    /// A foreign function, identified by the embedder
    CFunction(u32),
}

impl fmt::Display for ExternalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExternalRef::Counter(c) => write!(f, "counter[{:?}]", c),
            ExternalRef::Runtime(r) => write!(f, "runtime::{}", r.name()),
            ExternalRef::CFunction(id) => write!(f, "cfunction#{}", id),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Whether a write barrier must update the remembered set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RememberedSetAction {
    Emit,
    Omit,
}

/// Whether out-of-line code must preserve double registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveFpRegsMode {
    DontSave,
    Save,
}

/// Reasons passed to the abort routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    WrongAddressOrValuePassedToRecordWrite = 1,
    UnexpectedAllocationTop,
    UnalignedAllocationInNewSpace,
    OperandIsASmi,
    OperandIsNotSmi,
    OperandIsASmiAndNotAString,
    OperandIsNotAString,
    OperandIsASmiAndNotAFunction,
    OperandIsNotAFunction,
    ExpectedUndefinedOrCell,
    HeapNumberMapRegisterClobbered,
    UnalignedCellInWriteBarrier,
    RememberedSetPointerInNewSpace,
    ImpossibleMarkingBitPattern,
    JsObjectWithFastElementsMapHasSlowElements,
    GlobalFunctionsMustHaveInitialMap,
    IndexIsTooLarge,
    IndexIsNegative,
    UnexpectedStringType,
}

impl AbortReason {
    const ALL: [AbortReason; 19] = [
        AbortReason::WrongAddressOrValuePassedToRecordWrite,
        AbortReason::UnexpectedAllocationTop,
        AbortReason::UnalignedAllocationInNewSpace,
        AbortReason::OperandIsASmi,
        AbortReason::OperandIsNotSmi,
        AbortReason::OperandIsASmiAndNotAString,
        AbortReason::OperandIsNotAString,
        AbortReason::OperandIsASmiAndNotAFunction,
        AbortReason::OperandIsNotAFunction,
        AbortReason::ExpectedUndefinedOrCell,
        AbortReason::HeapNumberMapRegisterClobbered,
        AbortReason::UnalignedCellInWriteBarrier,
        AbortReason::RememberedSetPointerInNewSpace,
        AbortReason::ImpossibleMarkingBitPattern,
        AbortReason::JsObjectWithFastElementsMapHasSlowElements,
        AbortReason::GlobalFunctionsMustHaveInitialMap,
        AbortReason::IndexIsTooLarge,
        AbortReason::IndexIsNegative,
        AbortReason::UnexpectedStringType,
    ];

    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.iter().copied().find(|r| r.code() == code)
    }

    pub fn message(self) -> &'static str {
        match self {
            AbortReason::WrongAddressOrValuePassedToRecordWrite => {
                "Wrong address or value passed to RecordWrite"
            }
            AbortReason::UnexpectedAllocationTop => "Unexpected allocation top",
            AbortReason::UnalignedAllocationInNewSpace => "Unaligned allocation in new space",
            AbortReason::OperandIsASmi => "Operand is a smi",
            AbortReason::OperandIsNotSmi => "Operand is not smi",
            AbortReason::OperandIsASmiAndNotAString => "Operand is a smi and not a string",
            AbortReason::OperandIsNotAString => "Operand is not a string",
            AbortReason::OperandIsASmiAndNotAFunction => "Operand is a smi and not a function",
            AbortReason::OperandIsNotAFunction => "Operand is not a function",
            AbortReason::ExpectedUndefinedOrCell => "Expected undefined or cell in register",
            AbortReason::HeapNumberMapRegisterClobbered => "HeapNumberMap register clobbered",
            AbortReason::UnalignedCellInWriteBarrier => "Unaligned cell in write barrier",
            AbortReason::RememberedSetPointerInNewSpace => "Remembered set pointer is in new space",
            AbortReason::ImpossibleMarkingBitPattern => "Impossible marking bit pattern",
            AbortReason::JsObjectWithFastElementsMapHasSlowElements => {
                "JSObject with fast elements map has slow elements"
            }
            AbortReason::GlobalFunctionsMustHaveInitialMap => {
                "Global functions must have initial map"
            }
            AbortReason::IndexIsTooLarge => "Index is too large",
            AbortReason::IndexIsNegative => "Index is negative",
            AbortReason::UnexpectedStringType => "Unexpected string type",
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_scale_with_width() {
        let l64 = HeapLayout::new(WordWidth::W64);
        let l32 = HeapLayout::new(WordWidth::W32);
        assert_eq!(l64.heap_number_size(), 16);
        assert_eq!(l32.heap_number_size(), 12);
        assert_eq!(l64.seq_string_header_size(), 24);
        assert_eq!(l32.seq_string_header_size(), 12);
        assert_eq!(l64.seq_string_header_size() as i64 & l64.object_alignment_mask(), 0);
    }

    #[test]
    fn test_frame_offsets() {
        let l = HeapLayout::new(WordWidth::W64);
        assert_eq!(l.caller_pc_offset(), 8);
        assert_eq!(l.caller_sp_offset(), 16);
        assert_eq!(l.context_offset(), -8);
        assert_eq!(l.fixed_frame_size_from_fp(), 16);
        assert_eq!(l.required_stack_frame_slots() * 8, 160);
    }

    #[test]
    fn test_store_buffer_overflow_bit() {
        assert_eq!(HeapLayout::new(WordWidth::W64).store_buffer_overflow_bit(), 1 << 17);
        assert_eq!(HeapLayout::new(WordWidth::W32).store_buffer_overflow_bit(), 1 << 16);
    }

    #[test]
    fn test_root_table_is_complete() {
        for (i, root) in RootIndex::ALL.iter().enumerate() {
            assert_eq!(root.index() as usize, i);
        }
        assert_eq!(RootIndex::HeapNumberMap.map_instance_type(), Some(instance_type::HEAP_NUMBER_TYPE));
        assert_eq!(RootIndex::UndefinedValue.map_instance_type(), None);
    }

    #[test]
    fn test_abort_reason_codes() {
        for reason in AbortReason::ALL {
            assert_eq!(AbortReason::from_code(reason.code()), Some(reason));
        }
        assert_eq!(AbortReason::from_code(0), None);
    }
}
