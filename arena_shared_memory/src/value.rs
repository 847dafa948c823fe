//! Bundled client value system.
//!
//! [`Value`] is a small N-d array model: dense numeric, logical and char
//! arrays (optionally complex), compressed sparse column matrices, struct
//! arrays and cell arrays. Leaf storage is either owned or a read-only view
//! into a shared segment, which is what makes fetching zero-copy.

use crate::client::{ClassId, ClientValue, DataBlock};
use crate::error::{ArenaError, ArenaResult};
use std::ptr::NonNull;

/// Leaf storage block.
#[derive(Debug)]
pub enum Block {
    /// Locally allocated bytes.
    Owned(Vec<u8>),
    /// Bytes inside a shared segment mapping.
    Mapped {
        /// Start of the block.
        ptr: NonNull<u8>,
        /// Length in bytes.
        len: usize,
    },
}

impl Block {
    fn empty() -> Self {
        Self::Owned(Vec::new())
    }

    fn zeroed(len: usize) -> Self {
        Self::Owned(vec![0; len])
    }

    /// Block contents.
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Self::Owned(bytes) => bytes,
            // SAFETY: `set_raw_data` callers guarantee the mapping outlives
            // the block.
            Self::Mapped { ptr, len } => unsafe { std::slice::from_raw_parts(ptr.as_ptr(), *len) },
        }
    }

    /// True if the block aliases shared memory.
    pub fn is_mapped(&self) -> bool {
        matches!(self, Self::Mapped { .. })
    }

    fn to_local(&self) -> Self {
        Self::Owned(self.as_slice().to_vec())
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

#[derive(Debug, PartialEq)]
enum Storage {
    Dense {
        real: Block,
        imag: Option<Block>,
    },
    Sparse {
        nzmax: u64,
        real: Block,
        imag: Option<Block>,
        row_index: Block,
        col_ptr: Block,
    },
    Struct {
        field_names: Vec<String>,
        children: Vec<Value>,
    },
    Cell {
        children: Vec<Value>,
    },
}

/// Primitive element types of dense arrays.
pub trait Element: Copy + sealed::Sealed {
    /// Class of arrays holding this element type.
    const CLASS: ClassId;

    #[doc(hidden)]
    fn append_ne(self, out: &mut Vec<u8>);

    #[doc(hidden)]
    fn from_ne(bytes: &[u8]) -> Self;
}

mod sealed {
    pub trait Sealed {}
}

macro_rules! impl_element {
    ($($ty:ty => $class:ident),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}

            impl Element for $ty {
                const CLASS: ClassId = ClassId::$class;

                fn append_ne(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_ne_bytes());
                }

                fn from_ne(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_ne_bytes(raw)
                }
            }
        )*
    };
}

impl_element! {
    f64 => Double,
    f32 => Single,
    i8 => Int8,
    u8 => UInt8,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
}

fn encode<T: Element>(data: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(std::mem::size_of_val(data));
    for &item in data {
        item.append_ne(&mut out);
    }
    out
}

fn decode<T: Element>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(std::mem::size_of::<T>())
        .map(T::from_ne)
        .collect()
}

fn invalid(reason: impl Into<String>) -> ArenaError {
    ArenaError::InvalidValue {
        reason: reason.into(),
    }
}

fn checked_numel(dims: &[u64]) -> ArenaResult<u64> {
    if dims.len() < 2 {
        return Err(invalid(format!(
            "at least two dimensions required, got {}",
            dims.len()
        )));
    }
    dims.iter()
        .try_fold(1u64, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| invalid("element count overflows"))
}

fn check_len(dims: &[u64], len: usize) -> ArenaResult<()> {
    let numel = checked_numel(dims)?;
    if numel != len as u64 {
        return Err(invalid(format!(
            "dimensions {dims:?} hold {numel} elements, {len} supplied"
        )));
    }
    Ok(())
}

/// A client value.
#[derive(Debug, PartialEq)]
pub struct Value {
    class: ClassId,
    dims: Vec<u64>,
    storage: Storage,
}

impl Value {
    /// Dense real array in column-major order.
    pub fn numeric<T: Element>(dims: &[u64], data: &[T]) -> ArenaResult<Self> {
        check_len(dims, data.len())?;
        Ok(Self {
            class: T::CLASS,
            dims: dims.to_vec(),
            storage: Storage::Dense {
                real: Block::Owned(encode(data)),
                imag: None,
            },
        })
    }

    /// Dense complex array.
    pub fn complex<T: Element>(dims: &[u64], real: &[T], imag: &[T]) -> ArenaResult<Self> {
        check_len(dims, real.len())?;
        check_len(dims, imag.len())?;
        Ok(Self {
            class: T::CLASS,
            dims: dims.to_vec(),
            storage: Storage::Dense {
                real: Block::Owned(encode(real)),
                imag: Some(Block::Owned(encode(imag))),
            },
        })
    }

    /// 1×1 double.
    pub fn scalar(value: f64) -> Self {
        Self {
            class: ClassId::Double,
            dims: vec![1, 1],
            storage: Storage::Dense {
                real: Block::Owned(value.to_ne_bytes().to_vec()),
                imag: None,
            },
        }
    }

    /// Logical array.
    pub fn logical(dims: &[u64], data: &[bool]) -> ArenaResult<Self> {
        check_len(dims, data.len())?;
        Ok(Self {
            class: ClassId::Logical,
            dims: dims.to_vec(),
            storage: Storage::Dense {
                real: Block::Owned(data.iter().map(|&b| b as u8).collect()),
                imag: None,
            },
        })
    }

    /// 1×N character array.
    pub fn text(text: &str) -> Self {
        let units: Vec<u16> = text.encode_utf16().collect();
        Self {
            class: ClassId::Char,
            dims: vec![1, units.len() as u64],
            storage: Storage::Dense {
                real: Block::Owned(encode(&units)),
                imag: None,
            },
        }
    }

    /// Empty value (0×0) of the given class.
    pub fn empty(class: ClassId) -> Self {
        let mut value = Self::create_empty(class, false, false, &[]);
        value.dims = vec![0, 0];
        value
    }

    /// Sparse double matrix in compressed sparse column form.
    pub fn sparse(
        rows: u64,
        cols: u64,
        row_index: &[u64],
        col_ptr: &[u64],
        values: &[f64],
    ) -> ArenaResult<Self> {
        Self::sparse_from_bytes(
            ClassId::Double,
            rows,
            cols,
            row_index,
            col_ptr,
            encode(values),
            values.len(),
        )
    }

    /// Sparse logical matrix in compressed sparse column form.
    pub fn sparse_logical(
        rows: u64,
        cols: u64,
        row_index: &[u64],
        col_ptr: &[u64],
        values: &[bool],
    ) -> ArenaResult<Self> {
        Self::sparse_from_bytes(
            ClassId::Logical,
            rows,
            cols,
            row_index,
            col_ptr,
            values.iter().map(|&b| b as u8).collect(),
            values.len(),
        )
    }

    fn sparse_from_bytes(
        class: ClassId,
        rows: u64,
        cols: u64,
        row_index: &[u64],
        col_ptr: &[u64],
        mut values: Vec<u8>,
        nnz: usize,
    ) -> ArenaResult<Self> {
        checked_numel(&[rows, cols])?;
        let num_ptrs = cols
            .checked_add(1)
            .ok_or_else(|| invalid("column count overflows"))?;
        if col_ptr.len() as u64 != num_ptrs {
            return Err(invalid("column pointer array must have cols + 1 entries"));
        }
        if col_ptr.first() != Some(&0) || col_ptr.windows(2).any(|w| w[0] > w[1]) {
            return Err(invalid("column pointers must start at 0 and not decrease"));
        }
        if col_ptr.last().copied() != Some(nnz as u64) || row_index.len() != nnz {
            return Err(invalid("nonzero count disagrees between arrays"));
        }
        if row_index.iter().any(|&r| r >= rows) {
            return Err(invalid("row index out of range"));
        }

        // Sparse storage never has zero capacity.
        let nzmax = nnz.max(1);
        let elem = class.elem_size();
        values.resize(nzmax * elem, 0);
        let mut rows_bytes = encode(row_index);
        rows_bytes.resize(nzmax * 8, 0);

        Ok(Self {
            class,
            dims: vec![rows, cols],
            storage: Storage::Sparse {
                nzmax: nzmax as u64,
                real: Block::Owned(values),
                imag: None,
                row_index: Block::Owned(rows_bytes),
                col_ptr: Block::Owned(encode(col_ptr)),
            },
        })
    }

    /// Struct array; `children` are element-major.
    pub fn structure(
        dims: &[u64],
        field_names: &[&str],
        children: Vec<Value>,
    ) -> ArenaResult<Self> {
        let numel = checked_numel(dims)?;
        let needed = numel
            .checked_mul(field_names.len() as u64)
            .ok_or_else(|| invalid("child count overflows"))?;
        if needed != children.len() as u64 {
            return Err(invalid(format!(
                "{numel} elements × {} fields need {needed} children, got {}",
                field_names.len(),
                children.len()
            )));
        }
        for (i, name) in field_names.iter().enumerate() {
            if name.is_empty() || name.bytes().any(|b| b == 0 || b == 0xFF) {
                return Err(invalid(format!("illegal field name '{name}'")));
            }
            if field_names[..i].contains(name) {
                return Err(invalid(format!("duplicate field name '{name}'")));
            }
        }
        Ok(Self {
            class: ClassId::Struct,
            dims: dims.to_vec(),
            storage: Storage::Struct {
                field_names: field_names.iter().map(|s| s.to_string()).collect(),
                children,
            },
        })
    }

    /// Cell array; `children` in column-major order.
    pub fn cell(dims: &[u64], children: Vec<Value>) -> ArenaResult<Self> {
        check_len(dims, children.len())?;
        Ok(Self {
            class: ClassId::Cell,
            dims: dims.to_vec(),
            storage: Storage::Cell { children },
        })
    }

    /// Real part as a typed vector, if the class matches.
    pub fn to_vec<T: Element>(&self) -> Option<Vec<T>> {
        if self.class != T::CLASS {
            return None;
        }
        match &self.storage {
            Storage::Dense { real, .. } | Storage::Sparse { real, .. } => {
                Some(decode(real.as_slice()))
            }
            _ => None,
        }
    }

    /// Imaginary part as a typed vector, if present.
    pub fn imag_to_vec<T: Element>(&self) -> Option<Vec<T>> {
        if self.class != T::CLASS {
            return None;
        }
        match &self.storage {
            Storage::Dense { imag: Some(imag), .. } | Storage::Sparse { imag: Some(imag), .. } => {
                Some(decode(imag.as_slice()))
            }
            _ => None,
        }
    }

    /// Logical contents.
    pub fn to_bools(&self) -> Option<Vec<bool>> {
        if self.class != ClassId::Logical {
            return None;
        }
        self.data(DataBlock::Real)
            .map(|bytes| bytes.iter().map(|&b| b != 0).collect())
    }

    /// Character contents.
    pub fn to_text(&self) -> Option<String> {
        if self.class != ClassId::Char {
            return None;
        }
        let units: Vec<u16> = decode(self.data(DataBlock::Real)?);
        Some(String::from_utf16_lossy(&units))
    }

    /// Row indices and column pointers of a sparse matrix, trimmed to the
    /// stored nonzeros.
    pub fn sparse_indices(&self) -> Option<(Vec<u64>, Vec<u64>)> {
        match &self.storage {
            Storage::Sparse {
                row_index, col_ptr, ..
            } => {
                let cols: Vec<u64> = decode(col_ptr.as_slice());
                let nnz = cols.last().copied().unwrap_or(0) as usize;
                let mut rows: Vec<u64> = decode(row_index.as_slice());
                rows.truncate(nnz);
                Some((rows, cols))
            }
            _ => None,
        }
    }

    /// Field `name` of struct element `element`.
    pub fn field(&self, element: usize, name: &str) -> Option<&Value> {
        match &self.storage {
            Storage::Struct {
                field_names,
                children,
            } => {
                let field = field_names.iter().position(|f| f == name)?;
                children.get(element * field_names.len() + field)
            }
            _ => None,
        }
    }

    /// Element `index` of a cell array.
    pub fn cell_at(&self, index: usize) -> Option<&Value> {
        match &self.storage {
            Storage::Cell { children } => children.get(index),
            _ => None,
        }
    }

    /// True if any storage block anywhere in the tree aliases shared memory.
    pub fn is_mapped(&self) -> bool {
        match &self.storage {
            Storage::Dense { real, imag } => real.is_mapped() || imag.as_ref().is_some_and(Block::is_mapped),
            Storage::Sparse {
                real,
                imag,
                row_index,
                col_ptr,
                ..
            } => {
                real.is_mapped()
                    || imag.as_ref().is_some_and(Block::is_mapped)
                    || row_index.is_mapped()
                    || col_ptr.is_mapped()
            }
            Storage::Struct { children, .. } | Storage::Cell { children } => {
                children.iter().any(Value::is_mapped)
            }
        }
    }

    fn block_mut(&mut self, block: DataBlock) -> Option<&mut Block> {
        match (&mut self.storage, block) {
            (Storage::Dense { real, .. }, DataBlock::Real)
            | (Storage::Sparse { real, .. }, DataBlock::Real) => Some(real),
            (Storage::Dense { imag, .. }, DataBlock::Imag)
            | (Storage::Sparse { imag, .. }, DataBlock::Imag) => {
                Some(imag.get_or_insert_with(Block::empty))
            }
            (Storage::Sparse { row_index, .. }, DataBlock::RowIndex) => Some(row_index),
            (Storage::Sparse { col_ptr, .. }, DataBlock::ColPtr) => Some(col_ptr),
            _ => None,
        }
    }
}

impl ClientValue for Value {
    fn class_id(&self) -> ClassId {
        self.class
    }

    fn dims(&self) -> &[u64] {
        &self.dims
    }

    fn is_sparse(&self) -> bool {
        matches!(self.storage, Storage::Sparse { .. })
    }

    fn is_complex(&self) -> bool {
        matches!(
            self.storage,
            Storage::Dense { imag: Some(_), .. } | Storage::Sparse { imag: Some(_), .. }
        )
    }

    fn nzmax(&self) -> u64 {
        match &self.storage {
            Storage::Sparse { nzmax, .. } => *nzmax,
            _ => self.numel(),
        }
    }

    fn field_names(&self) -> &[String] {
        match &self.storage {
            Storage::Struct { field_names, .. } => field_names,
            _ => &[],
        }
    }

    fn child(&self, index: usize) -> Option<&Self> {
        match &self.storage {
            Storage::Struct { children, .. } | Storage::Cell { children } => children.get(index),
            _ => None,
        }
    }

    fn child_mut(&mut self, index: usize) -> Option<&mut Self> {
        match &mut self.storage {
            Storage::Struct { children, .. } | Storage::Cell { children } => {
                children.get_mut(index)
            }
            _ => None,
        }
    }

    fn data(&self, block: DataBlock) -> Option<&[u8]> {
        match (&self.storage, block) {
            (Storage::Dense { real, .. }, DataBlock::Real)
            | (Storage::Sparse { real, .. }, DataBlock::Real) => Some(real.as_slice()),
            (Storage::Dense { imag, .. }, DataBlock::Imag)
            | (Storage::Sparse { imag, .. }, DataBlock::Imag) => {
                imag.as_ref().map(Block::as_slice)
            }
            (Storage::Sparse { row_index, .. }, DataBlock::RowIndex) => Some(row_index.as_slice()),
            (Storage::Sparse { col_ptr, .. }, DataBlock::ColPtr) => Some(col_ptr.as_slice()),
            _ => None,
        }
    }

    fn create_empty(class: ClassId, complex: bool, sparse: bool, field_names: &[String]) -> Self {
        let storage = match class {
            ClassId::Struct => Storage::Struct {
                field_names: field_names.to_vec(),
                children: Vec::new(),
            },
            ClassId::Cell => Storage::Cell {
                children: Vec::new(),
            },
            _ if sparse => Storage::Sparse {
                nzmax: 0,
                real: Block::empty(),
                imag: complex.then(Block::empty),
                row_index: Block::empty(),
                col_ptr: Block::empty(),
            },
            _ => Storage::Dense {
                real: Block::empty(),
                imag: complex.then(Block::empty),
            },
        };
        Self {
            class,
            dims: vec![0, 0],
            storage,
        }
    }

    fn set_dimensions(&mut self, dims: &[u64]) {
        self.dims = dims.to_vec();
    }

    fn set_nzmax(&mut self, value: u64) {
        if let Storage::Sparse { nzmax, .. } = &mut self.storage {
            *nzmax = value;
        }
    }

    fn set_children(&mut self, new_children: Vec<Self>) {
        match &mut self.storage {
            Storage::Struct { children, .. } | Storage::Cell { children } => {
                *children = new_children
            }
            _ => debug_assert!(false, "set_children on a leaf"),
        }
    }

    unsafe fn set_raw_data(&mut self, block: DataBlock, ptr: NonNull<u8>, len: usize) {
        let class = self.class;
        match self.block_mut(block) {
            Some(slot) => *slot = Block::Mapped { ptr, len },
            None => debug_assert!(false, "{block:?} is not a block of {class:?}"),
        }
    }

    fn make_local_empty(&mut self) {
        let elem = self.class.elem_size();
        match &mut self.storage {
            Storage::Dense { real, imag } => {
                *real = Block::empty();
                if let Some(imag) = imag {
                    *imag = Block::empty();
                }
            }
            Storage::Sparse {
                nzmax,
                real,
                imag,
                row_index,
                col_ptr,
            } => {
                *nzmax = 1;
                *real = Block::zeroed(elem);
                if let Some(imag) = imag {
                    *imag = Block::zeroed(elem);
                }
                *row_index = Block::zeroed(8);
                *col_ptr = Block::zeroed(8);
            }
            Storage::Struct { .. } | Storage::Cell { .. } => return,
        }
        self.dims = vec![0, 0];
    }

    fn duplicate(&self) -> Self {
        let storage = match &self.storage {
            Storage::Dense { real, imag } => Storage::Dense {
                real: real.to_local(),
                imag: imag.as_ref().map(Block::to_local),
            },
            Storage::Sparse {
                nzmax,
                real,
                imag,
                row_index,
                col_ptr,
            } => Storage::Sparse {
                nzmax: *nzmax,
                real: real.to_local(),
                imag: imag.as_ref().map(Block::to_local),
                row_index: row_index.to_local(),
                col_ptr: col_ptr.to_local(),
            },
            Storage::Struct {
                field_names,
                children,
            } => Storage::Struct {
                field_names: field_names.clone(),
                children: children.iter().map(Value::duplicate).collect(),
            },
            Storage::Cell { children } => Storage::Cell {
                children: children.iter().map(Value::duplicate).collect(),
            },
        };
        Self {
            class: self.class,
            dims: self.dims.clone(),
            storage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_roundtrip_through_bytes() {
        let v = Value::numeric(&[2, 2], &[1i32, -2, 3, -4]).unwrap();
        assert_eq!(v.class_id(), ClassId::Int32);
        assert_eq!(v.to_vec::<i32>().unwrap(), vec![1, -2, 3, -4]);
        assert!(v.to_vec::<f64>().is_none());
        assert_eq!(v.numel(), 4);
    }

    #[test]
    fn dims_must_match_data() {
        assert!(Value::numeric(&[3, 3], &[1.0f64; 8]).is_err());
        assert!(Value::numeric(&[9], &[1.0f64; 9]).is_err());
    }

    #[test]
    fn sparse_keeps_one_slot_when_empty() {
        let v = Value::sparse(3, 2, &[], &[0, 0, 0], &[]).unwrap();
        assert!(v.is_sparse());
        assert_eq!(v.nzmax(), 1);
        assert_eq!(v.data(DataBlock::Real).unwrap().len(), 8);
        assert_eq!(v.data(DataBlock::ColPtr).unwrap().len(), 24);
    }

    #[test]
    fn sparse_rejects_bad_pointers() {
        assert!(Value::sparse(3, 2, &[0], &[0, 1], &[1.0]).is_err());
        assert!(Value::sparse(3, 1, &[5], &[0, 1], &[1.0]).is_err());
        assert!(Value::sparse(3, 1, &[0, 1], &[0, 1], &[1.0, 2.0]).is_err());
    }

    #[test]
    fn struct_field_lookup_is_element_major() {
        let v = Value::structure(
            &[1, 2],
            &["a", "b"],
            vec![
                Value::scalar(1.0),
                Value::scalar(2.0),
                Value::scalar(3.0),
                Value::scalar(4.0),
            ],
        )
        .unwrap();
        assert_eq!(v.field(1, "a").unwrap().to_vec::<f64>().unwrap(), vec![3.0]);
        assert_eq!(v.field(0, "b").unwrap().to_vec::<f64>().unwrap(), vec![2.0]);
        assert!(v.field(0, "c").is_none());
    }

    #[test]
    fn struct_rejects_duplicate_fields() {
        let err = Value::structure(
            &[1, 1],
            &["a", "a"],
            vec![Value::scalar(1.0), Value::scalar(2.0)],
        );
        assert!(err.is_err());
    }

    #[test]
    fn make_local_empty_detaches_storage() {
        let mut v = Value::complex(&[1, 2], &[1.0f64, 2.0], &[3.0, 4.0]).unwrap();
        v.make_local_empty();
        assert!(v.is_empty());
        assert!(v.is_complex());
        assert_eq!(v.data(DataBlock::Real).unwrap().len(), 0);

        let mut s = Value::sparse(2, 2, &[0, 1], &[0, 1, 2], &[5.0, 6.0]).unwrap();
        s.make_local_empty();
        assert_eq!(s.nzmax(), 1);
        assert_eq!(s.dims(), &[0, 0]);
    }

    #[test]
    fn text_is_utf16() {
        let v = Value::text("héllo");
        assert_eq!(v.dims(), &[1, 5]);
        assert_eq!(v.elem_size(), 2);
        assert_eq!(v.to_text().unwrap(), "héllo");
    }

    #[test]
    fn duplicate_is_deep() {
        let v = Value::cell(&[1, 2], vec![Value::text("x"), Value::scalar(2.0)]).unwrap();
        let d = v.duplicate();
        assert_eq!(d, v);
        assert!(!d.is_mapped());
    }

    #[test]
    fn oversized_shapes_rejected() {
        let rejected = |r: ArenaResult<Value>| matches!(r, Err(ArenaError::InvalidValue { .. }));

        assert!(rejected(Value::sparse(2, u64::MAX, &[], &[0], &[])));
        assert!(rejected(Value::sparse(u64::MAX, 2, &[], &[0, 0, 0], &[])));
        assert!(rejected(Value::structure(
            &[u64::MAX / 2, 1],
            &["a", "b", "c"],
            Vec::new()
        )));
        assert!(rejected(Value::numeric::<f64>(&[u64::MAX, 2], &[])));

        // Largest sparse shape whose element count still fits.
        let tall = Value::sparse(u64::MAX, 1, &[], &[0, 0], &[]).unwrap();
        assert_eq!(tall.numel(), u64::MAX);
    }
}
