//! Serialization of client value trees into segment payloads.
//!
//! Five pure operations over a flat byte buffer:
//!
//! - [`compute_size`]: exact byte size a value needs
//! - [`copy_into`]: write a value into a buffer of that size
//! - [`materialize`]: rebuild a value whose leaf blocks alias the buffer
//! - [`compare_shape`] / [`overwrite`]: replace leaf bytes in place when
//!   the layout is identical
//! - [`detach`]: cut a value loose from the buffer it aliases
//!
//! The layout is described in [`layout`].

pub mod layout;

use crate::client::{ClassId, ClientValue, DataBlock, ValueFlags};
use crate::error::{ArenaError, ArenaResult};
use layout::{
    BLOCK_SLOT, BlockSignature, CHILDREN_SLOT, NAMES_SLOT, NODE_HEADER_SIZE, NodeHeader,
    SIGNATURE_MAGIC, get_bytes, get_u64, leaf_block_lens, name_table_len, pad_to_alignment,
    put_bytes, put_u64, read_name_table, write_name_table,
};
use std::ptr::NonNull;

pub use layout::ALIGNMENT;

fn mismatch(detail: impl Into<String>) -> ArenaError {
    ArenaError::LayoutMismatch {
        detail: detail.into(),
    }
}

fn checked_numel(dims: &[u64]) -> Option<u64> {
    dims.iter().try_fold(1u64, |acc, &d| acc.checked_mul(d))
}

fn value_numel<V: ClientValue>(value: &V) -> ArenaResult<u64> {
    checked_numel(value.dims()).ok_or_else(|| ArenaError::InvalidValue {
        reason: format!("element count of {:?} overflows", value.dims()),
    })
}

/// Allocated slots: the client's count for sparse leaves, `numel` otherwise.
fn value_nzmax<V: ClientValue>(value: &V, numel: u64) -> u64 {
    if value.is_sparse() {
        value.nzmax().max(1)
    } else {
        numel
    }
}

/// Number of children of a container node.
fn child_count<V: ClientValue>(value: &V) -> ArenaResult<usize> {
    let numel = value_numel(value)?;
    let fields = match value.class_id() {
        ClassId::Struct => value.field_names().len() as u64,
        _ => 1,
    };
    numel
        .checked_mul(fields)
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| ArenaError::InvalidValue {
            reason: "child count overflows".to_string(),
        })
}

fn child_at<V: ClientValue>(value: &V, index: usize) -> ArenaResult<&V> {
    value.child(index).ok_or_else(|| ArenaError::InvalidValue {
        reason: format!("{:?} value is missing child {index}", value.class_id()),
    })
}

fn dims_region(num_dims: usize) -> usize {
    NODE_HEADER_SIZE + pad_to_alignment(num_dims * 8)
}

fn value_block_lens<V: ClientValue>(value: &V) -> ArenaResult<[usize; 4]> {
    let numel = value_numel(value)?;
    leaf_block_lens(
        value.class_id(),
        value.dims(),
        numel,
        value_nzmax(value, numel),
        value.is_complex(),
        value.is_sparse(),
    )
}

/// Exact number of bytes [`copy_into`] writes for `value`.
///
/// Always a multiple of [`ALIGNMENT`].
pub fn compute_size<V: ClientValue>(value: &V) -> ArenaResult<usize> {
    let class = value.class_id();
    let mut size = dims_region(value.dims().len());

    if class.is_container() {
        let n = child_count(value)?;
        size += pad_to_alignment(n * 8);
        if class == ClassId::Struct {
            size += pad_to_alignment(name_table_len(value.field_names()));
        }
        for i in 0..n {
            size += compute_size(child_at(value, i)?)?;
        }
    } else {
        for len in value_block_lens(value)? {
            if len > 0 {
                size += BLOCK_SLOT + pad_to_alignment(len);
            }
        }
    }
    Ok(size)
}

/// Serialize `value` at the start of `dest`. Returns the bytes written,
/// which equals [`compute_size`].
///
/// Padding is zeroed, so the whole written range is deterministic.
pub fn copy_into<V: ClientValue>(dest: &mut [u8], value: &V) -> ArenaResult<usize> {
    let size = compute_size(value)?;
    if dest.len() < size {
        return Err(mismatch(format!(
            "destination holds {} bytes, value needs {size}",
            dest.len()
        )));
    }
    dest[..size].fill(0);
    let written = write_node(dest, 0, value)?;
    debug_assert_eq!(written, size);
    Ok(written)
}

fn write_node<V: ClientValue>(buf: &mut [u8], base: usize, value: &V) -> ArenaResult<usize> {
    let class = value.class_id();
    let dims = value.dims();
    let numel = value_numel(value)?;
    if value.elem_size() != class.elem_size() {
        return Err(ArenaError::InvalidValue {
            reason: format!(
                "{class:?} elements are {} bytes, value reports {}",
                class.elem_size(),
                value.elem_size()
            ),
        });
    }

    let mut flags = ValueFlags::empty();
    flags.set(ValueFlags::EMPTY, numel == 0);
    flags.set(ValueFlags::SPARSE, value.is_sparse());
    flags.set(ValueFlags::COMPLEX, value.is_complex());
    flags.set(ValueFlags::NUMERIC, value.is_numeric());

    let mut header = NodeHeader {
        num_elems: numel,
        nzmax: value_nzmax(value, numel),
        elem_size: class.elem_size() as u32,
        num_dims: dims.len() as u32,
        num_fields: value.field_names().len() as u32,
        class_id: class.as_raw(),
        flags: flags.bits(),
        ..NodeHeader::default()
    };

    for (i, d) in dims.iter().enumerate() {
        put_u64(buf, base + NODE_HEADER_SIZE + i * 8, *d)?;
    }
    let mut cursor = dims_region(dims.len());

    if class.is_container() {
        let n = child_count(value)?;
        let table = cursor;
        if n > 0 {
            header.offsets[CHILDREN_SLOT] = table as u64;
        }
        cursor += pad_to_alignment(n * 8);

        if class == ClassId::Struct {
            header.offsets[NAMES_SLOT] = cursor as u64;
            let len = write_name_table(buf, base + cursor, value.field_names())?;
            cursor += pad_to_alignment(len);
        }

        for i in 0..n {
            put_u64(buf, base + table + i * 8, cursor as u64)?;
            cursor += write_node(buf, base + cursor, child_at(value, i)?)?;
        }
    } else {
        let lens = value_block_lens(value)?;
        for block in DataBlock::ALL {
            let len = lens[block.index()];
            if len == 0 {
                continue;
            }
            let data = value.data(block).ok_or_else(|| ArenaError::InvalidValue {
                reason: format!("{class:?} value has no {block:?} block"),
            })?;
            if data.len() != len {
                return Err(ArenaError::InvalidValue {
                    reason: format!(
                        "{block:?} block holds {} bytes, shape needs {len}",
                        data.len()
                    ),
                });
            }
            let start = cursor + BLOCK_SLOT;
            BlockSignature::for_len(len).write_before(buf, base + start)?;
            put_bytes(buf, base + start, data)?;
            header.offsets[block.index()] = start as u64;
            cursor = start + pad_to_alignment(len);
        }
    }

    header.write_to(buf, base)?;
    Ok(cursor)
}

/// Checked header of a node already in a buffer.
struct ParsedNode {
    header: NodeHeader,
    class: ClassId,
    flags: ValueFlags,
    dims: Vec<u64>,
}

fn parse_node(buf: &[u8], base: usize) -> ArenaResult<ParsedNode> {
    let header = NodeHeader::read_from(buf, base)?;
    let class = ClassId::from_raw(header.class_id).ok_or(ArenaError::UnknownClass {
        tag: header.class_id,
    })?;
    let flags = ValueFlags::from_bits(header.flags).ok_or_else(|| {
        ArenaError::corruption(format!("unknown node flags {:#x}", header.flags))
    })?;
    if header.elem_size as usize != class.elem_size() {
        return Err(ArenaError::corruption(format!(
            "{class:?} node records element size {}",
            header.elem_size
        )));
    }

    let num_dims = header.num_dims as usize;
    if num_dims < 2 {
        return Err(ArenaError::corruption(format!(
            "node records {num_dims} dimensions"
        )));
    }
    let raw = get_bytes(buf, base + NODE_HEADER_SIZE, num_dims * 8)?;
    let dims: Vec<u64> = raw
        .chunks_exact(8)
        .map(|c| u64::from_ne_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect();
    if checked_numel(&dims) != Some(header.num_elems) {
        return Err(ArenaError::corruption(
            "element count disagrees with dimensions",
        ));
    }
    if flags.contains(ValueFlags::EMPTY) != (header.num_elems == 0) {
        return Err(ArenaError::corruption("empty flag disagrees with element count"));
    }
    Ok(ParsedNode {
        header,
        class,
        flags,
        dims,
    })
}

fn node_child_count(node: &ParsedNode) -> ArenaResult<usize> {
    let fields = match node.class {
        ClassId::Struct => node.header.num_fields as u64,
        _ => 1,
    };
    node.header
        .num_elems
        .checked_mul(fields)
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| ArenaError::corruption("child count overflows"))
}

/// Absolute position of child `i`. Children always lie after their parent's
/// own regions, so recursion strictly advances through the buffer.
fn child_base(buf: &[u8], base: usize, node: &ParsedNode, i: usize) -> ArenaResult<usize> {
    let table = node.header.offsets[CHILDREN_SLOT] as usize;
    if table == 0 {
        return Err(ArenaError::corruption("container without child table"));
    }
    let at = base
        .checked_add(table)
        .and_then(|t| t.checked_add(i.checked_mul(8)?))
        .ok_or_else(|| ArenaError::corruption("child table offset overflows"))?;
    let offset = get_u64(buf, at)? as usize;
    if offset < dims_region(node.dims.len()) || offset % ALIGNMENT != 0 {
        return Err(ArenaError::corruption(format!(
            "child offset {offset} is misplaced"
        )));
    }
    base.checked_add(offset)
        .ok_or_else(|| ArenaError::corruption("child offset overflows"))
}

fn node_names(buf: &[u8], base: usize, node: &ParsedNode) -> ArenaResult<Vec<String>> {
    let at = node.header.offsets[NAMES_SLOT] as usize;
    if at == 0 {
        return Err(ArenaError::corruption("struct without field name table"));
    }
    let at = base
        .checked_add(at)
        .ok_or_else(|| ArenaError::corruption("name table offset overflows"))?;
    let names = read_name_table(buf, at)?;
    if names.len() != node.header.num_fields as usize {
        return Err(ArenaError::corruption(format!(
            "struct records {} fields, name table holds {}",
            node.header.num_fields,
            names.len()
        )));
    }
    Ok(names)
}

/// Locate the data blocks of a leaf node, verifying their signatures.
fn node_blocks(buf: &[u8], base: usize, node: &ParsedNode) -> ArenaResult<[Option<(usize, usize)>; 4]> {
    let lens = leaf_block_lens(
        node.class,
        &node.dims,
        node.header.num_elems,
        node.header.nzmax,
        node.flags.contains(ValueFlags::COMPLEX),
        node.flags.contains(ValueFlags::SPARSE),
    )
    .map_err(|e| ArenaError::corruption(e.to_string()))?;

    let mut blocks = [None; 4];
    for block in DataBlock::ALL {
        let len = lens[block.index()];
        let offset = node.header.offsets[block.index()] as usize;
        match (len, offset) {
            (0, 0) => {}
            (0, _) | (_, 0) => {
                return Err(ArenaError::corruption(format!(
                    "{block:?} block presence disagrees with node shape"
                )));
            }
            (len, offset) => {
                let start = base
                    .checked_add(offset)
                    .ok_or_else(|| ArenaError::corruption("block offset overflows"))?;
                if offset % ALIGNMENT != 0 {
                    return Err(ArenaError::corruption(format!(
                        "{block:?} block at unaligned offset {offset}"
                    )));
                }
                let sig = BlockSignature::read_before(buf, start)?;
                if sig != BlockSignature::for_len(len) {
                    return Err(ArenaError::corruption(format!(
                        "{block:?} block signature {:#x}/{} does not match {SIGNATURE_MAGIC:#x}/{}",
                        sig.magic,
                        sig.padded_size,
                        pad_to_alignment(len)
                    )));
                }
                get_bytes(buf, start, len)?;
                blocks[block.index()] = Some((start, len));
            }
        }
    }
    Ok(blocks)
}

/// Rebuild a value whose leaf storage aliases `buf`.
///
/// Cost is proportional to the tree shape, not the data size.
///
/// # Safety
///
/// `buf` must stay mapped, at the same address, until every leaf of the
/// returned value has been detached with [`detach`] or the value dropped.
pub unsafe fn materialize<V: ClientValue>(buf: &[u8]) -> ArenaResult<V> {
    // SAFETY: forwarded from the caller.
    unsafe { read_node(buf, 0) }
}

unsafe fn read_node<V: ClientValue>(buf: &[u8], base: usize) -> ArenaResult<V> {
    let node = parse_node(buf, base)?;

    match node.class {
        ClassId::Struct | ClassId::Cell => {
            let names = if node.class == ClassId::Struct {
                node_names(buf, base, &node)?
            } else {
                Vec::new()
            };
            let n = node_child_count(&node)?;
            let mut children = Vec::with_capacity(n);
            for i in 0..n {
                let at = child_base(buf, base, &node, i)?;
                // SAFETY: same buffer, same contract.
                children.push(unsafe { read_node(buf, at)? });
            }
            let mut value = V::create_empty(node.class, false, false, &names);
            value.set_dimensions(&node.dims);
            value.set_children(children);
            Ok(value)
        }
        class => {
            let sparse = node.flags.contains(ValueFlags::SPARSE);
            let blocks = node_blocks(buf, base, &node)?;
            let mut value = V::create_empty(
                class,
                node.flags.contains(ValueFlags::COMPLEX),
                sparse,
                &[],
            );
            value.set_dimensions(&node.dims);
            if sparse {
                value.set_nzmax(node.header.nzmax);
            }
            for block in DataBlock::ALL {
                if let Some((start, len)) = blocks[block.index()] {
                    let ptr = NonNull::from(&buf[start..start + len]).cast::<u8>();
                    // SAFETY: `start..start + len` was bounds-checked and the
                    // caller keeps `buf` alive.
                    unsafe { value.set_raw_data(block, ptr, len) };
                }
            }
            Ok(value)
        }
    }
}

/// True if `buf` holds a value with exactly the layout `value` would get:
/// same classes, dimensions, flags, sparse capacities and field names.
/// Data bytes are not compared.
pub fn compare_shape<V: ClientValue>(buf: &[u8], value: &V) -> ArenaResult<bool> {
    compare_node(buf, 0, value)
}

fn compare_node<V: ClientValue>(buf: &[u8], base: usize, value: &V) -> ArenaResult<bool> {
    let node = parse_node(buf, base)?;
    if node.class != value.class_id() || node.dims != value.dims() {
        return Ok(false);
    }
    if node.flags.contains(ValueFlags::SPARSE) != value.is_sparse()
        || node.flags.contains(ValueFlags::COMPLEX) != value.is_complex()
    {
        return Ok(false);
    }
    if value.is_sparse() && node.header.nzmax != value.nzmax().max(1) {
        return Ok(false);
    }

    if node.class.is_container() {
        if node.class == ClassId::Struct && node_names(buf, base, &node)? != value.field_names() {
            return Ok(false);
        }
        let n = node_child_count(&node)?;
        for i in 0..n {
            let at = child_base(buf, base, &node, i)?;
            if !compare_node(buf, at, child_at(value, i)?)? {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

/// Copy the leaf bytes of `value` into `buf` in place.
///
/// `value` must not alias `buf`; check with [`overlaps`] first.
///
/// # Errors
///
/// [`ArenaError::LayoutMismatch`] if [`compare_shape`] would return false.
pub fn overwrite<V: ClientValue>(buf: &mut [u8], value: &V) -> ArenaResult<()> {
    if !compare_shape(buf, value)? {
        return Err(mismatch("value shape differs from the stored layout"));
    }
    overwrite_node(buf, 0, value)
}

fn overwrite_node<V: ClientValue>(buf: &mut [u8], base: usize, value: &V) -> ArenaResult<()> {
    let node = parse_node(buf, base)?;
    if node.class.is_container() {
        let n = node_child_count(&node)?;
        for i in 0..n {
            let at = child_base(buf, base, &node, i)?;
            overwrite_node(buf, at, child_at(value, i)?)?;
        }
        return Ok(());
    }

    let blocks = node_blocks(buf, base, &node)?;
    for block in DataBlock::ALL {
        if let Some((start, len)) = blocks[block.index()] {
            let src = value
                .data(block)
                .filter(|d| d.len() == len)
                .ok_or_else(|| mismatch(format!("{block:?} block length differs")))?;
            buf[start..start + len].copy_from_slice(src);
        }
    }
    Ok(())
}

/// True if any leaf block of `value` lies inside `buf`, as it does for a
/// value materialized from `buf`.
pub fn overlaps<V: ClientValue>(value: &V, buf: &[u8]) -> bool {
    if value.class_id().is_container() {
        let mut i = 0;
        while let Some(child) = value.child(i) {
            if overlaps(child, buf) {
                return true;
            }
            i += 1;
        }
        return false;
    }
    let target = buf.as_ptr_range();
    DataBlock::ALL
        .iter()
        .filter_map(|&block| value.data(block))
        .filter(|data| !data.is_empty())
        .any(|data| {
            let range = data.as_ptr_range();
            range.start < target.end && target.start < range.end
        })
}

/// Replace every leaf's storage with minimal local storage, so the buffer
/// the value aliased can be unmapped.
pub fn detach<V: ClientValue>(value: &mut V) {
    if value.class_id().is_container() {
        let mut i = 0;
        while let Some(child) = value.child_mut(i) {
            detach(child);
            i += 1;
        }
    } else {
        value.make_local_empty();
    }
}
