//! Key extraction from statements and raw tuples.

use crate::cord::ExecContext;
use crate::field_map::{self, FieldMap};
use crate::format::TupleFormat;
use crate::functional;
use crate::key_def::KeyDef;
use crate::msgpack;
use crate::region::ScratchRegion;
use crate::stmt::Stmt;
use std::ops::Range;
use std::sync::Arc;
use tessera_common::{Result, TesseraError};

/// Appends the key of `data` to `out` as `[part, part, ...]`.
///
/// Missing parts are encoded as nil. `lookup` enables the field map fast
/// path; without it every part is located by walking the tuple.
fn extract_parts_into(
    out: &mut Vec<u8>,
    data: &[u8],
    lookup: Option<(&TupleFormat, FieldMap<'_>)>,
    key_def: &KeyDef,
    multikey_idx: Option<u32>,
) -> Result<()> {
    if key_def.is_multikey() && multikey_idx.is_none() {
        return Err(TesseraError::MultikeyIndexRequired);
    }
    rmp::encode::write_array_len(out, key_def.part_count())?;
    for part in key_def.parts() {
        let path = part.path.as_ref().map(|p| p.tokens()).unwrap_or(&[]);
        match field_map::locate_field(data, lookup, part.fieldno, path, multikey_idx)? {
            Some(value) => out.extend_from_slice(value),
            None => rmp::encode::write_nil(out).map_err(rmp::encode::ValueWriteError::InvalidMarkerWrite)?,
        }
    }
    Ok(())
}

/// Appends the encoded key array of `stmt` under `key_def` to `out`.
///
/// Functional key definitions read the statement's functional key cache.
pub fn extract_key_into(
    out: &mut Vec<u8>,
    stmt: &Stmt,
    key_def: &KeyDef,
    multikey_idx: Option<u32>,
) -> Result<()> {
    if let Some(fid) = key_def.func_id() {
        let cache = functional::key_get(stmt, fid);
        let index = multikey_idx.unwrap_or(0);
        let key = cache.key(index).ok_or_else(|| {
            TesseraError::Internal(format!(
                "functional key {} out of range ({} keys)",
                index,
                cache.key_count()
            ))
        })?;
        out.extend_from_slice(key);
        return Ok(());
    }
    let view = stmt.view();
    extract_parts_into(
        out,
        view.upsert_data(),
        Some((view.format(), view.field_map())),
        key_def,
        multikey_idx,
    )
}

/// Extracts the key of `stmt` into the scratch region and returns its range.
pub fn tuple_extract_key(
    region: &mut ScratchRegion,
    stmt: &Stmt,
    key_def: &KeyDef,
    multikey_idx: Option<u32>,
) -> Result<Range<usize>> {
    let start = region.used();
    let result = extract_key_into(region.buf_mut(), stmt, key_def, multikey_idx);
    match result {
        Ok(()) => Ok(start..region.used()),
        Err(err) => {
            region.truncate(start);
            Err(err)
        }
    }
}

/// Extracts the key of raw tuple `data` into the scratch region.
pub fn tuple_extract_key_raw(
    region: &mut ScratchRegion,
    data: &[u8],
    key_def: &KeyDef,
    multikey_idx: Option<u32>,
) -> Result<Range<usize>> {
    if key_def.is_functional() {
        return Err(TesseraError::InvalidKeyDef(
            "functional keys cannot be extracted from raw data".to_string(),
        ));
    }
    let start = region.used();
    let result = extract_parts_into(region.buf_mut(), data, None, key_def, multikey_idx);
    match result {
        Ok(()) => Ok(start..region.used()),
        Err(err) => {
            region.truncate(start);
            Err(err)
        }
    }
}

fn key_from_region(
    ctx: &mut ExecContext<'_>,
    key_format: &Arc<TupleFormat>,
    extract: impl FnOnce(&mut ScratchRegion) -> Result<Range<usize>>,
) -> Result<Stmt> {
    let cord = ctx.cord();
    let mut region = ctx.region().savepoint();
    let range = extract(&mut *region)?;
    let mut key = region.slice(range);
    let part_count = msgpack::decode_array_len(&mut key)?;
    Stmt::new_key(cord, key_format, key, part_count)
}

/// Builds the key statement of `stmt` under `key_def`.
///
/// Each multikey index of a multikey definition yields its own key.
pub fn extract_key(
    ctx: &mut ExecContext<'_>,
    stmt: &Stmt,
    key_def: &KeyDef,
    key_format: &Arc<TupleFormat>,
    multikey_idx: Option<u32>,
) -> Result<Stmt> {
    key_from_region(ctx, key_format, |region| {
        tuple_extract_key(region, stmt, key_def, multikey_idx)
    })
}

/// Builds the key statement of raw tuple `data` under `key_def`.
pub fn extract_key_raw(
    ctx: &mut ExecContext<'_>,
    data: &[u8],
    key_def: &KeyDef,
    key_format: &Arc<TupleFormat>,
    multikey_idx: Option<u32>,
) -> Result<Stmt> {
    key_from_region(ctx, key_format, |region| {
        tuple_extract_key_raw(region, data, key_def, multikey_idx)
    })
}

/// Copies one encoded key array into its own buffer.
pub fn key_dup(key: &[u8]) -> Result<Box<[u8]>> {
    if msgpack::peek_type(key)? != msgpack::MpType::Array {
        return Err(TesseraError::InvalidMsgPack("expected array".to_string()));
    }
    let span = msgpack::value_span(key)?;
    let mut buf = Vec::new();
    buf.try_reserve_exact(span)
        .map_err(|_| TesseraError::OutOfMemory {
            size: span,
            allocator: "malloc",
            object: "key",
        })?;
    buf.extend_from_slice(&key[..span]);
    Ok(buf.into_boxed_slice())
}
