//! Capability set the arena consumes from a client value system.
//!
//! The codec never looks inside a client value directly; it asks through
//! [`ClientValue`]. [`crate::value::Value`] is the bundled implementation.

use bitflags::bitflags;
use std::ptr::NonNull;

/// Type tag of a value node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ClassId {
    /// Container of arbitrary values.
    Cell = 1,
    /// Record array with named fields.
    Struct = 2,
    /// Boolean array, one byte per element.
    Logical = 3,
    /// UTF-16 character array.
    Char = 4,
    /// `f64` array.
    Double = 6,
    /// `f32` array.
    Single = 7,
    /// `i8` array.
    Int8 = 8,
    /// `u8` array.
    UInt8 = 9,
    /// `i16` array.
    Int16 = 10,
    /// `u16` array.
    UInt16 = 11,
    /// `i32` array.
    Int32 = 12,
    /// `u32` array.
    UInt32 = 13,
    /// `i64` array.
    Int64 = 14,
    /// `u64` array.
    UInt64 = 15,
}

impl ClassId {
    /// Convert from a serialized tag. Returns `None` for unknown tags.
    pub const fn from_raw(raw: u16) -> Option<Self> {
        Some(match raw {
            1 => Self::Cell,
            2 => Self::Struct,
            3 => Self::Logical,
            4 => Self::Char,
            6 => Self::Double,
            7 => Self::Single,
            8 => Self::Int8,
            9 => Self::UInt8,
            10 => Self::Int16,
            11 => Self::UInt16,
            12 => Self::Int32,
            13 => Self::UInt32,
            14 => Self::Int64,
            15 => Self::UInt64,
            _ => return None,
        })
    }

    /// Serialized tag.
    pub const fn as_raw(self) -> u16 {
        self as u16
    }

    /// Bytes per element. Containers count one offset slot per element.
    pub const fn elem_size(self) -> usize {
        match self {
            Self::Logical | Self::Int8 | Self::UInt8 => 1,
            Self::Char | Self::Int16 | Self::UInt16 => 2,
            Self::Single | Self::Int32 | Self::UInt32 => 4,
            Self::Double | Self::Int64 | Self::UInt64 | Self::Cell | Self::Struct => 8,
        }
    }

    /// True for arithmetic classes (not logical, char or containers).
    pub const fn is_numeric(self) -> bool {
        !matches!(
            self,
            Self::Cell | Self::Struct | Self::Logical | Self::Char
        )
    }

    /// True for cells and structs.
    pub const fn is_container(self) -> bool {
        matches!(self, Self::Cell | Self::Struct)
    }
}

/// One of the raw storage blocks of a leaf value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataBlock {
    /// Real part (all leaves).
    Real = 0,
    /// Imaginary part (complex leaves).
    Imag = 1,
    /// Row indices (sparse leaves).
    RowIndex = 2,
    /// Column start offsets (sparse leaves).
    ColPtr = 3,
}

impl DataBlock {
    /// Blocks in serialization order.
    pub const ALL: [DataBlock; 4] = [Self::Real, Self::Imag, Self::RowIndex, Self::ColPtr];

    /// Slot of this block in the node header offset table.
    pub const fn index(self) -> usize {
        self as usize
    }
}

bitflags! {
    /// Packed boolean properties of a serialized node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ValueFlags: u16 {
        /// No elements.
        const EMPTY   = 0x01;
        /// Compressed sparse column storage.
        const SPARSE  = 0x02;
        /// Has an imaginary block.
        const COMPLEX = 0x04;
        /// Arithmetic class.
        const NUMERIC = 0x08;
    }
}

impl Default for ValueFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Operations the arena needs from a value system.
///
/// Children of a struct are addressed element-major:
/// `index = element * num_fields + field`.
pub trait ClientValue: Sized {
    /// Type tag.
    fn class_id(&self) -> ClassId;

    /// Dimensions (at least two).
    fn dims(&self) -> &[u64];

    /// Bytes per element.
    fn elem_size(&self) -> usize {
        self.class_id().elem_size()
    }

    /// Compressed sparse column storage.
    fn is_sparse(&self) -> bool;

    /// Has an imaginary part.
    fn is_complex(&self) -> bool;

    /// No elements.
    fn is_empty(&self) -> bool {
        self.numel() == 0
    }

    /// Arithmetic class.
    fn is_numeric(&self) -> bool {
        self.class_id().is_numeric()
    }

    /// Product of the dimensions, saturating at `u64::MAX`.
    fn numel(&self) -> u64 {
        self.dims()
            .iter()
            .try_fold(1u64, |acc, &d| acc.checked_mul(d))
            .unwrap_or(u64::MAX)
    }

    /// Allocated nonzero slots of a sparse value; element count otherwise.
    fn nzmax(&self) -> u64;

    /// Field names of a struct, in order. Empty for other classes.
    fn field_names(&self) -> &[String];

    /// Child at `index` of a cell or struct.
    fn child(&self, index: usize) -> Option<&Self>;

    /// Mutable child at `index` of a cell or struct.
    fn child_mut(&mut self, index: usize) -> Option<&mut Self>;

    /// Bytes of a leaf storage block, if present.
    fn data(&self, block: DataBlock) -> Option<&[u8]>;

    /// New zero-size shell of the given shape class.
    fn create_empty(class: ClassId, complex: bool, sparse: bool, field_names: &[String]) -> Self;

    /// Replace the dimensions of a shell.
    fn set_dimensions(&mut self, dims: &[u64]);

    /// Set the nonzero capacity of a sparse shell.
    fn set_nzmax(&mut self, nzmax: u64);

    /// Attach the children of a cell or struct shell.
    fn set_children(&mut self, children: Vec<Self>);

    /// Point a leaf storage block at external memory.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads of `len` bytes until the block is
    /// replaced through [`ClientValue::make_local_empty`] or the value is
    /// dropped.
    unsafe fn set_raw_data(&mut self, block: DataBlock, ptr: NonNull<u8>, len: usize);

    /// Replace the storage of a leaf with minimal local storage
    /// (empty, or a single slot for sparse values).
    fn make_local_empty(&mut self);

    /// Deep copy into locally owned storage.
    fn duplicate(&self) -> Self;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_tags_roundtrip() {
        for raw in 0..32u16 {
            if let Some(class) = ClassId::from_raw(raw) {
                assert_eq!(class.as_raw(), raw);
            }
        }
        assert!(ClassId::from_raw(5).is_none());
        assert!(ClassId::from_raw(0).is_none());
    }

    #[test]
    fn element_sizes() {
        assert_eq!(ClassId::Char.elem_size(), 2);
        assert_eq!(ClassId::Logical.elem_size(), 1);
        assert_eq!(ClassId::Double.elem_size(), 8);
        assert!(ClassId::Int16.is_numeric());
        assert!(!ClassId::Char.is_numeric());
        assert!(ClassId::Struct.is_container());
    }
}
