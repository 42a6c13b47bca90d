//! Statement <-> wire record mapping.
//!
//! Primary index records carry full tuples (or keys for DELETE) plus the
//! space id. Secondary index records carry only the extracted key, as a
//! tuple for INSERT/REPLACE and as a key for DELETE.

use crate::constants::{KEY_KEY, KEY_OPS, KEY_TUPLE, META_FLAGS};
use crate::record::WireRecord;
use bytes::Bytes;
use std::sync::Arc;
use tessera_common::{Result, StmtFlags, StmtType, TesseraError};
use tessera_stmt::key::extract_key_into;
use tessera_stmt::msgpack;
use tessera_stmt::{ExecContext, KeyDef, Stmt, TupleFormat};
use tracing::{debug, warn};

/// Encodes the persistent flags of `stmt`, or nothing if none survive.
fn encode_meta(stmt: &Stmt, is_primary: bool) -> Result<Option<Bytes>> {
    let flags = stmt.flags().persistent(is_primary);
    if flags.is_empty() {
        return Ok(None);
    }
    let mut buf = Vec::new();
    rmp::encode::write_map_len(&mut buf, 1)?;
    rmp::encode::write_uint(&mut buf, u64::from(META_FLAGS))?;
    rmp::encode::write_uint(&mut buf, u64::from(flags.0))?;
    Ok(Some(Bytes::from(buf)))
}

/// Applies a tuple metadata map; unknown keys are skipped.
fn decode_meta(stmt: &mut Stmt, mut meta: &[u8]) -> Result<()> {
    let count = msgpack::decode_map_len(&mut meta)?;
    for _ in 0..count {
        let key = msgpack::decode_uint(&mut meta)?;
        if key == u64::from(META_FLAGS) {
            let flags = msgpack::decode_uint(&mut meta)?;
            let flags = u8::try_from(flags).map_err(|_| {
                TesseraError::InvalidRecord(format!("flags out of range: {}", flags))
            })?;
            stmt.set_flags(StmtFlags(flags))?;
        } else {
            msgpack::skip(&mut meta)?;
        }
    }
    Ok(())
}

/// Payload of `stmt` as a key: as-is for key statements, extracted otherwise.
fn key_bytes(stmt: &Stmt, key_def: &KeyDef, multikey_idx: Option<u32>) -> Result<Bytes> {
    if stmt.is_key() {
        return Ok(Bytes::copy_from_slice(stmt.view().data()));
    }
    let mut buf = Vec::new();
    extract_key_into(&mut buf, stmt, key_def, multikey_idx)?;
    Ok(Bytes::from(buf))
}

/// Encodes a statement of the primary index of space `space_id`.
pub fn encode_primary(stmt: &Stmt, key_def: &KeyDef, space_id: u32) -> Result<WireRecord> {
    let view = stmt.view();
    let mut record = WireRecord::new(view.stmt_type(), view.lsn());
    record.space_id = Some(space_id);
    match view.stmt_type() {
        StmtType::Delete => record.key = Some(key_bytes(stmt, key_def, None)?),
        StmtType::Insert | StmtType::Replace => {
            record.tuple = Some(Bytes::copy_from_slice(view.data()));
        }
        StmtType::Upsert => {
            let ops = view.upsert_ops();
            if msgpack::value_span(ops)? != ops.len() {
                return Err(TesseraError::InvalidRecord(
                    "upsert operations must be a single array".to_string(),
                ));
            }
            record.tuple = Some(Bytes::copy_from_slice(view.upsert_data()));
            record.ops = Some(Bytes::copy_from_slice(ops));
        }
        StmtType::Unset => {
            return Err(TesseraError::InvalidRecord(
                "cannot encode a statement without a request type".to_string(),
            ))
        }
    }
    record.tuple_meta = encode_meta(stmt, true)?;
    Ok(record)
}

/// Encodes a statement of a secondary index ordered by `cmp_def`.
pub fn encode_secondary(stmt: &Stmt, cmp_def: &KeyDef, multikey_idx: Option<u32>) -> Result<WireRecord> {
    let view = stmt.view();
    let mut record = WireRecord::new(view.stmt_type(), view.lsn());
    match view.stmt_type() {
        StmtType::Insert | StmtType::Replace => {
            record.tuple = Some(key_bytes(stmt, cmp_def, multikey_idx)?);
        }
        StmtType::Delete => record.key = Some(key_bytes(stmt, cmp_def, multikey_idx)?),
        other => {
            return Err(TesseraError::InvalidRecord(format!(
                "{} statements are not stored in secondary indexes",
                other
            )))
        }
    }
    record.tuple_meta = encode_meta(stmt, false)?;
    Ok(record)
}

fn required<'a>(record: &'a WireRecord, field: &'a Option<Bytes>, key: u8) -> Result<&'a [u8]> {
    field.as_deref().ok_or_else(|| {
        TesseraError::InvalidRecord(format!(
            "lsn {}: {} request is missing key 0x{:02x}",
            record.lsn, record.stmt_type, key
        ))
    })
}

/// Rebuilds a statement from `record`.
///
/// DELETE statements are always built with `key_format`; others with
/// `format`. The LSN and persisted flags are restored. Failures to build
/// the statement are reported as [`TesseraError::StmtDecode`] carrying the
/// record's LSN.
pub fn decode(
    ctx: &mut ExecContext<'_>,
    record: &WireRecord,
    format: &Arc<TupleFormat>,
    key_format: &Arc<TupleFormat>,
) -> Result<Stmt> {
    if record.stmt_type == StmtType::Unset {
        warn!(lsn = record.lsn, "cannot decode statement");
        return Err(TesseraError::InvalidRecord(format!(
            "Can't decode statement: unknown request type {}",
            record.stmt_type as u8
        )));
    }
    let (stmt_format, data, ops) = match record.stmt_type {
        StmtType::Delete => (key_format, required(record, &record.key, KEY_KEY)?, None),
        StmtType::Upsert => (
            format,
            required(record, &record.tuple, KEY_TUPLE)?,
            Some(required(record, &record.ops, KEY_OPS)?),
        ),
        _ => (format, required(record, &record.tuple, KEY_TUPLE)?, None),
    };
    let stmt = build(ctx, record, stmt_format, data, ops).map_err(|e| {
        warn!(lsn = record.lsn, error = %e, "cannot decode statement");
        TesseraError::StmtDecode {
            lsn: record.lsn,
            source: Box::new(e),
        }
    })?;
    debug!(lsn = record.lsn, stmt_type = %record.stmt_type, "statement decoded");
    Ok(stmt)
}

fn build(
    ctx: &mut ExecContext<'_>,
    record: &WireRecord,
    format: &Arc<TupleFormat>,
    data: &[u8],
    ops: Option<&[u8]>,
) -> Result<Stmt> {
    let mut stmt = match ops {
        Some(ops) => Stmt::new_upsert(ctx, format, data, &[ops])?,
        None => Stmt::new_with_ops(ctx, format, data, &[], record.stmt_type)?,
    };
    if let Some(meta) = &record.tuple_meta {
        decode_meta(&mut stmt, meta)?;
    }
    stmt.set_lsn(record.lsn)?;
    Ok(stmt)
}
