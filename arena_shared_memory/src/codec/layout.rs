//! Byte layout of a serialized value node.
//!
//! ```text
//! node  := header(64) dims(pad) body
//! body  := struct: offsets(pad) names(pad) child*
//!        | cell:   offsets(pad) child*
//!        | leaf:   (slot(32) block(pad))*      // real, imag, row index, col ptr
//! names := (name NUL)* 0xFF len:u32
//! slot  := zero* signature(16)                 // signature ends where the block starts
//! ```
//!
//! Every region is padded to [`ALIGNMENT`], so every node, offset table and
//! data block starts aligned. Offsets are relative to the start of the node
//! that holds them.

use crate::client::{ClassId, DataBlock};
use crate::error::{ArenaError, ArenaResult};

/// Alignment of every node and data block.
pub const ALIGNMENT: usize = 32;

/// `ALIGNMENT - 1`.
pub const ALIGN_MASK: usize = ALIGNMENT - 1;

/// Serialized size of [`NodeHeader`].
pub const NODE_HEADER_SIZE: usize = 64;

/// Bytes reserved in front of every data block.
pub const BLOCK_SLOT: usize = ALIGNMENT;

/// Size of [`BlockSignature`].
pub const SIGNATURE_SIZE: usize = 16;

/// Marks a signature written by this codec.
pub const SIGNATURE_MAGIC: u32 = 0xFEED_FACE;

/// Terminates the field-name table. Not valid in a name.
pub const NAME_TABLE_END: u8 = 0xFF;

/// Round `size` up to the next multiple of [`ALIGNMENT`].
///
/// `pad_to_alignment(0) == 0`.
#[inline]
pub const fn pad_to_alignment(size: usize) -> usize {
    if size == 0 {
        0
    } else {
        size + (ALIGN_MASK - ((size - 1) & ALIGN_MASK))
    }
}

/// Fixed-size head of every node.
///
/// | bytes  | field        |
/// |--------|--------------|
/// | 0..32  | `offsets`    |
/// | 32..40 | `num_elems`  |
/// | 40..48 | `nzmax`      |
/// | 48..52 | `elem_size`  |
/// | 52..56 | `num_dims`   |
/// | 56..60 | `num_fields` |
/// | 60..62 | `class_id`   |
/// | 62..64 | `flags`      |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeHeader {
    /// Leaves: one per [`DataBlock`]. Containers: `[children, names, 0, 0]`.
    /// Zero means absent.
    pub offsets: [u64; 4],
    /// Product of the dimensions.
    pub num_elems: u64,
    /// Sparse capacity; element count otherwise.
    pub nzmax: u64,
    /// Bytes per element.
    pub elem_size: u32,
    /// Length of the dims array.
    pub num_dims: u32,
    /// Struct field count.
    pub num_fields: u32,
    /// [`ClassId`] tag.
    pub class_id: u16,
    /// [`crate::client::ValueFlags`] bits.
    pub flags: u16,
}

/// Index of the child offset table in [`NodeHeader::offsets`].
pub const CHILDREN_SLOT: usize = 0;
/// Index of the field-name table in [`NodeHeader::offsets`].
pub const NAMES_SLOT: usize = 1;

impl NodeHeader {
    /// Serialize into the first 64 bytes of `out`.
    pub fn write_to(&self, out: &mut [u8], at: usize) -> ArenaResult<()> {
        for (i, offset) in self.offsets.iter().enumerate() {
            put_u64(out, at + i * 8, *offset)?;
        }
        put_u64(out, at + 32, self.num_elems)?;
        put_u64(out, at + 40, self.nzmax)?;
        put_u32(out, at + 48, self.elem_size)?;
        put_u32(out, at + 52, self.num_dims)?;
        put_u32(out, at + 56, self.num_fields)?;
        put_bytes(out, at + 60, &self.class_id.to_ne_bytes())?;
        put_bytes(out, at + 62, &self.flags.to_ne_bytes())
    }

    /// Deserialize from `buf` at `at`.
    pub fn read_from(buf: &[u8], at: usize) -> ArenaResult<Self> {
        let mut offsets = [0u64; 4];
        for (i, offset) in offsets.iter_mut().enumerate() {
            *offset = get_u64(buf, at + i * 8)?;
        }
        let class = get_bytes(buf, at + 60, 2)?;
        let flags = get_bytes(buf, at + 62, 2)?;
        Ok(Self {
            offsets,
            num_elems: get_u64(buf, at + 32)?,
            nzmax: get_u64(buf, at + 40)?,
            elem_size: get_u32(buf, at + 48)?,
            num_dims: get_u32(buf, at + 52)?,
            num_fields: get_u32(buf, at + 56)?,
            class_id: u16::from_ne_bytes([class[0], class[1]]),
            flags: u16::from_ne_bytes([flags[0], flags[1]]),
        })
    }
}

/// Allocator-style signature in front of each data block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSignature {
    /// [`SIGNATURE_MAGIC`].
    pub magic: u32,
    /// [`ALIGNMENT`].
    pub alignment: u32,
    /// Block length rounded up to the alignment.
    pub padded_size: u64,
}

impl BlockSignature {
    /// Signature for a block of `len` bytes.
    pub const fn for_len(len: usize) -> Self {
        Self {
            magic: SIGNATURE_MAGIC,
            alignment: ALIGNMENT as u32,
            padded_size: pad_to_alignment(len) as u64,
        }
    }

    /// Write so that the signature ends at `block_start`.
    pub fn write_before(&self, out: &mut [u8], block_start: usize) -> ArenaResult<()> {
        let at = block_start - SIGNATURE_SIZE;
        put_u32(out, at, self.magic)?;
        put_u32(out, at + 4, self.alignment)?;
        put_u64(out, at + 8, self.padded_size)
    }

    /// Read the signature ending at `block_start`.
    pub fn read_before(buf: &[u8], block_start: usize) -> ArenaResult<Self> {
        let at = block_start
            .checked_sub(SIGNATURE_SIZE)
            .ok_or_else(|| ArenaError::corruption("data block overlaps its node header"))?;
        Ok(Self {
            magic: get_u32(buf, at)?,
            alignment: get_u32(buf, at + 4)?,
            padded_size: get_u64(buf, at + 8)?,
        })
    }
}

/// Serialized size of a field-name table, before padding.
pub fn name_table_len<S: AsRef<str>>(names: &[S]) -> usize {
    names.iter().map(|n| n.as_ref().len() + 1).sum::<usize>() + 1 + 4
}

/// Write a field-name table at `at`. Returns its unpadded length.
pub fn write_name_table<S: AsRef<str>>(out: &mut [u8], at: usize, names: &[S]) -> ArenaResult<usize> {
    let mut cursor = at;
    for name in names {
        let bytes = name.as_ref().as_bytes();
        if bytes.iter().any(|&b| b == 0 || b == NAME_TABLE_END) {
            return Err(ArenaError::InvalidValue {
                reason: format!("field name '{}' contains a reserved byte", name.as_ref()),
            });
        }
        put_bytes(out, cursor, bytes)?;
        put_bytes(out, cursor + bytes.len(), &[0])?;
        cursor += bytes.len() + 1;
    }
    put_bytes(out, cursor, &[NAME_TABLE_END])?;
    cursor += 1;
    put_u32(out, cursor, (cursor - at) as u32)?;
    Ok(cursor + 4 - at)
}

/// Read a field-name table at `at`, checking its recorded length.
pub fn read_name_table(buf: &[u8], at: usize) -> ArenaResult<Vec<String>> {
    let mut names = Vec::new();
    let mut cursor = at;
    loop {
        let rest = buf
            .get(cursor..)
            .ok_or_else(|| ArenaError::corruption("field name table out of bounds"))?;
        if rest.first() == Some(&NAME_TABLE_END) {
            cursor += 1;
            break;
        }
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| ArenaError::corruption("unterminated field name"))?;
        let name = std::str::from_utf8(&rest[..end])
            .map_err(|_| ArenaError::corruption("field name is not UTF-8"))?;
        names.push(name.to_string());
        cursor += end + 1;
    }

    let recorded = get_u32(buf, cursor)? as usize;
    if recorded != cursor - at {
        return Err(ArenaError::corruption(format!(
            "field name table length mismatch: recorded {recorded}, found {}",
            cursor - at
        )));
    }
    Ok(names)
}

/// Lengths of the leaf data blocks in [`DataBlock::ALL`] order; 0 = absent.
///
/// Empty dense leaves have no blocks. Sparse leaves always have every index
/// block and at least one value slot.
pub fn leaf_block_lens(
    class: ClassId,
    dims: &[u64],
    numel: u64,
    nzmax: u64,
    complex: bool,
    sparse: bool,
) -> ArenaResult<[usize; 4]> {
    let elem = class.elem_size() as u64;
    let bytes = |n: u64, size: u64| -> ArenaResult<usize> {
        n.checked_mul(size)
            .and_then(|b| usize::try_from(b).ok())
            .ok_or_else(|| ArenaError::InvalidValue {
                reason: "data block size overflows".to_string(),
            })
    };

    let mut lens = [0usize; 4];
    if sparse {
        if dims.len() != 2 {
            return Err(ArenaError::InvalidValue {
                reason: format!("sparse values are 2-D, got {} dimensions", dims.len()),
            });
        }
        let nzmax = nzmax.max(1);
        lens[DataBlock::Real.index()] = bytes(nzmax, elem)?;
        if complex {
            lens[DataBlock::Imag.index()] = bytes(nzmax, elem)?;
        }
        lens[DataBlock::RowIndex.index()] = bytes(nzmax, 8)?;
        let num_ptrs = dims[1].checked_add(1).ok_or_else(|| ArenaError::InvalidValue {
            reason: "column count overflows".to_string(),
        })?;
        lens[DataBlock::ColPtr.index()] = bytes(num_ptrs, 8)?;
    } else if numel > 0 {
        lens[DataBlock::Real.index()] = bytes(numel, elem)?;
        if complex {
            lens[DataBlock::Imag.index()] = bytes(numel, elem)?;
        }
    }
    Ok(lens)
}

fn out_of_bounds(at: usize, len: usize, buf_len: usize) -> ArenaError {
    ArenaError::corruption(format!(
        "access of {len} bytes at {at} outside buffer of {buf_len} bytes"
    ))
}

/// Bounds-checked sub-slice.
pub fn get_bytes(buf: &[u8], at: usize, len: usize) -> ArenaResult<&[u8]> {
    at.checked_add(len)
        .and_then(|end| buf.get(at..end))
        .ok_or_else(|| out_of_bounds(at, len, buf.len()))
}

/// Bounds-checked copy into `out`.
pub fn put_bytes(out: &mut [u8], at: usize, bytes: &[u8]) -> ArenaResult<()> {
    let buf_len = out.len();
    at.checked_add(bytes.len())
        .and_then(|end| out.get_mut(at..end))
        .ok_or_else(|| ArenaError::LayoutMismatch {
            detail: format!(
                "write of {} bytes at {at} outside buffer of {buf_len} bytes",
                bytes.len()
            ),
        })?
        .copy_from_slice(bytes);
    Ok(())
}

/// Read a native-endian `u64`.
pub fn get_u64(buf: &[u8], at: usize) -> ArenaResult<u64> {
    let b = get_bytes(buf, at, 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(b);
    Ok(u64::from_ne_bytes(raw))
}

/// Read a native-endian `u32`.
pub fn get_u32(buf: &[u8], at: usize) -> ArenaResult<u32> {
    let b = get_bytes(buf, at, 4)?;
    Ok(u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
}

/// Write a native-endian `u64`.
pub fn put_u64(out: &mut [u8], at: usize, value: u64) -> ArenaResult<()> {
    put_bytes(out, at, &value.to_ne_bytes())
}

/// Write a native-endian `u32`.
pub fn put_u32(out: &mut [u8], at: usize, value: u32) -> ArenaResult<()> {
    put_bytes(out, at, &value.to_ne_bytes())
}
