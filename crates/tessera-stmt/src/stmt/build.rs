//! Statement constructors.

use super::{RegionStmt, Stmt, StmtHeader};
use crate::cord::{Cord, ExecContext};
use crate::field_map::{self, FieldMapBuilder};
use crate::format::{TupleField, TupleFormat};
use crate::lsregion::LsRegion;
use crate::msgpack::{self, MpType};
use std::sync::Arc;
use tessera_common::{Result, StmtType, TesseraError};

/// Allocates a statement buffer and writes a fresh header.
fn alloc(format: &TupleFormat, data_offset: usize, bsize: usize) -> Result<Box<[u8]>> {
    debug_assert!(data_offset >= StmtHeader::SIZE + format.field_map_size() as usize);
    let data_offset_u16 = u16::try_from(data_offset)
        .map_err(|_| TesseraError::Internal(format!("data offset {} out of range", data_offset)))?;
    let bsize_u32 = u32::try_from(bsize).map_err(|_| TesseraError::MaxTupleSize {
        size: data_offset + bsize,
        max: u32::MAX as usize,
    })?;
    let mut raw = format.vtab().construct(format, data_offset + bsize)?;
    StmtHeader::new(format.id(), data_offset_u16, bsize_u32).write_to(&mut raw);
    Ok(raw)
}

impl Stmt {
    /// Builds a statement from a tuple, its field map and upsert operations.
    pub(crate) fn build(
        cord: Cord<'_>,
        format: &Arc<TupleFormat>,
        builder: &FieldMapBuilder,
        tuple: &[u8],
        ops: &[&[u8]],
        stmt_type: StmtType,
    ) -> Result<Stmt> {
        let ops_size: usize = ops.iter().map(|op| op.len()).sum();
        let data_offset = StmtHeader::SIZE + builder.size();
        let mut raw = alloc(format, data_offset, tuple.len() + ops_size)?;

        builder.build_into(&mut raw[StmtHeader::SIZE..data_offset]);
        let mut pos = data_offset;
        raw[pos..pos + tuple.len()].copy_from_slice(tuple);
        pos += tuple.len();
        for op in ops {
            raw[pos..pos + op.len()].copy_from_slice(op);
            pos += op.len();
        }
        StmtHeader::set_type(&mut raw, stmt_type);
        Ok(Stmt::from_raw(raw, format, cord))
    }

    /// Builds a typed statement from a MessagePack tuple and operations.
    ///
    /// The field map is computed without type validation: statements read
    /// back from older runs may not conform to the current format.
    pub fn new_with_ops(
        ctx: &mut ExecContext<'_>,
        format: &Arc<TupleFormat>,
        tuple: &[u8],
        ops: &[&[u8]],
        stmt_type: StmtType,
    ) -> Result<Stmt> {
        msgpack::check_array(tuple)?;
        let builder = field_map::field_map_create(format, tuple, false)?;
        Stmt::build(ctx.cord(), format, &builder, tuple, ops, stmt_type)
    }

    pub fn new_insert(ctx: &mut ExecContext<'_>, format: &Arc<TupleFormat>, tuple: &[u8]) -> Result<Stmt> {
        Stmt::new_with_ops(ctx, format, tuple, &[], StmtType::Insert)
    }

    pub fn new_replace(ctx: &mut ExecContext<'_>, format: &Arc<TupleFormat>, tuple: &[u8]) -> Result<Stmt> {
        Stmt::new_with_ops(ctx, format, tuple, &[], StmtType::Replace)
    }

    /// DELETE carrying the full tuple.
    pub fn new_delete(ctx: &mut ExecContext<'_>, format: &Arc<TupleFormat>, tuple: &[u8]) -> Result<Stmt> {
        Stmt::new_with_ops(ctx, format, tuple, &[], StmtType::Delete)
    }

    pub fn new_upsert(
        ctx: &mut ExecContext<'_>,
        format: &Arc<TupleFormat>,
        tuple: &[u8],
        ops: &[&[u8]],
    ) -> Result<Stmt> {
        Stmt::new_with_ops(ctx, format, tuple, ops, StmtType::Upsert)
    }

    /// Builds a key statement from `part_count` key parts (the elements of
    /// a key array, without its header).
    pub fn new_key(cord: Cord<'_>, key_format: &Arc<TupleFormat>, parts: &[u8], part_count: u32) -> Result<Stmt> {
        debug_assert!(key_format.is_key());
        debug_assert_eq!(key_format.field_map_size(), 0);
        let key_size = msgpack::values_span(parts, part_count)?;
        let header_size = msgpack::sizeof_array(part_count);
        let mut raw = alloc(key_format, StmtHeader::SIZE, header_size + key_size)?;

        let mut dst = &mut raw[StmtHeader::SIZE..];
        rmp::encode::write_array_len(&mut dst, part_count)?;
        dst[..key_size].copy_from_slice(&parts[..key_size]);
        Ok(Stmt::from_raw(raw, key_format, cord))
    }

    /// Byte copy into a fresh allocation with its own reference count.
    pub fn dup(&self, cord: Cord<'_>) -> Result<Stmt> {
        let view = self.view();
        let format = self.format();
        let mut raw = alloc(format, view.data_offset() as usize, view.bsize() as usize)?;
        raw.copy_from_slice(view.raw());
        Ok(Stmt::from_raw(raw, format, cord))
    }

    /// Copies the statement into `region` under `alloc_id`.
    ///
    /// UPSERTs get one leading byte, zeroed, for the apply counter.
    pub fn dup_region(&self, region: &LsRegion, alloc_id: i64) -> Result<RegionStmt> {
        let view = self.view();
        let base = usize::from(view.stmt_type() == StmtType::Upsert);
        let mut buf = region.alloc(view.size() + base, alloc_id)?;
        buf[0..base].fill(0);
        buf[base..].copy_from_slice(view.raw());
        Ok(RegionStmt {
            bytes: buf.freeze(),
            base,
            alloc_id,
            format: self.format().clone(),
        })
    }

    /// Turns an UPSERT into a REPLACE of the same payload tuple and LSN,
    /// dropping the operations.
    pub fn replace_from_upsert(&self, cord: Cord<'_>) -> Result<Stmt> {
        let view = self.view();
        if view.stmt_type() != StmtType::Upsert {
            return Err(TesseraError::Internal(format!(
                "replace_from_upsert on {} statement",
                view.stmt_type()
            )));
        }
        let bsize = view.upsert_data().len();
        let data_offset = view.data_offset() as usize;
        let format = self.format();
        let mut raw = alloc(format, data_offset, bsize)?;
        raw[StmtHeader::SIZE..].copy_from_slice(&view.raw()[StmtHeader::SIZE..data_offset + bsize]);
        StmtHeader::set_type(&mut raw, StmtType::Replace);
        StmtHeader::set_lsn(&mut raw, view.lsn());
        Ok(Stmt::from_raw(raw, format, cord))
    }

    /// DELETE holding only the indexed fields of this statement's tuple.
    pub fn new_surrogate_delete(&self, ctx: &mut ExecContext<'_>) -> Result<Stmt> {
        let view = self.view();
        new_surrogate_delete_raw(ctx, self.format(), view.upsert_data())
    }
}

/// Builds a DELETE from `data` keeping only what the format's field tree
/// indexes.
///
/// Unindexed array elements become nil, unindexed map entries become a
/// nil key with a nil value, containers on the way to indexed leaves get
/// re-encoded headers.
pub fn new_surrogate_delete_raw(ctx: &mut ExecContext<'_>, format: &Arc<TupleFormat>, data: &[u8]) -> Result<Stmt> {
    let cord = ctx.cord();
    let mut region = ctx.region().savepoint();
    region.reserve(data.len())?;
    let start = region.used();

    let mut builder = FieldMapBuilder::new(format.slot_count());
    let mut cursor = data;
    let tuple_fields = msgpack::decode_array_len(&mut cursor)?;
    let field_count = tuple_fields.min(format.index_field_count());
    {
        let out = region.buf_mut();
        rmp::encode::write_array_len(out, field_count)?;
        for field in format.fields().iter().take(field_count as usize) {
            project(Some(field), &mut cursor, out, start, &mut builder)?;
        }
    }
    let end = region.used();

    let data_offset = StmtHeader::SIZE + builder.size();
    let mut raw = alloc(format, data_offset, end - start)?;
    builder.build_into(&mut raw[StmtHeader::SIZE..data_offset]);
    raw[data_offset..].copy_from_slice(region.slice(start..end));
    StmtHeader::set_type(&mut raw, StmtType::Delete);
    Ok(Stmt::from_raw(raw, format, cord))
}

/// Copies the value at `cursor` into `out` as described by `field` and
/// advances past it.
fn project<'a>(
    field: Option<&TupleField>,
    cursor: &mut &'a [u8],
    out: &mut Vec<u8>,
    base: usize,
    builder: &mut FieldMapBuilder,
) -> Result<()> {
    let data: &'a [u8] = *cursor;
    let span = msgpack::value_span(data)?;
    let value = &data[..span];
    *cursor = &data[span..];
    let field = match field {
        Some(f) if f.is_key_part() || !f.children().is_empty() => f,
        _ => {
            rmp::encode::write_nil(out).map_err(rmp::encode::ValueWriteError::InvalidMarkerWrite)?;
            return Ok(());
        }
    };

    if let Some(slot) = field.offset_slot() {
        builder.set(slot, out.len() - base);
    }
    let mp = msgpack::peek_type(value)?;
    if field.children().is_empty() || !matches!(mp, MpType::Array | MpType::Map) {
        out.extend_from_slice(value);
        return Ok(());
    }

    let mut inner = value;
    if mp == MpType::Array {
        let len = msgpack::decode_array_len(&mut inner)?;
        let emitted = if field.is_multikey_array() {
            len
        } else {
            len.min(field.indexed_element_count())
        };
        rmp::encode::write_array_len(out, emitted)?;
        for index in 0..emitted {
            project(field.child_for_index(index), &mut inner, out, base, builder)?;
        }
    } else {
        let len = msgpack::decode_map_len(&mut inner)?;
        rmp::encode::write_map_len(out, len)?;
        for _ in 0..len {
            let key_start = inner;
            let child = if msgpack::peek_type(inner)? == MpType::Str {
                let key = msgpack::decode_str(&mut inner)?;
                field.child_for_key(key)
            } else {
                msgpack::skip(&mut inner)?;
                None
            };
            match child {
                Some(child) => {
                    out.extend_from_slice(&key_start[..key_start.len() - inner.len()]);
                    project(Some(child), &mut inner, out, base, builder)?;
                }
                None => {
                    rmp::encode::write_nil(out).map_err(rmp::encode::ValueWriteError::InvalidMarkerWrite)?;
                    rmp::encode::write_nil(out).map_err(rmp::encode::ValueWriteError::InvalidMarkerWrite)?;
                    msgpack::skip(&mut inner)?;
                }
            }
        }
    }
    Ok(())
}
