//! Functional key cache.
//!
//! A functional index derives its keys by calling a stored function on the
//! statement. The result is validated once ([`materialize`]) and cached next
//! to the statement, so later lookups ([`key_get`]) are a table read.
//!
//! Cache layout:
//!
//! ```text
//! +-----------+-----------+-----+-------------+----------------------+
//! | N (u32)   | off_1     | ... | total (u32) | key_0 key_1 ... key_N-1 |
//! +-----------+-----------+-----+-------------+----------------------+
//! ```
//!
//! `N + 1` little-endian words: the key count, the start of keys `1..N`
//! relative to the key area, and the key area size. Key 0 starts at 0.
//! Every key is a complete MessagePack array.
//!
//! Lookup assumes the statement was materialized first. A missing entry is
//! recomputed, and if that fails the process panics: a key that cannot be
//! derived at lookup time means persisted state is corrupt.

use crate::format::FunctionalHandle;
use crate::func::{Func, Port};
use crate::key_def::{self, KeyDef};
use crate::msgpack::{self, MpType};
use crate::stmt::Stmt;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;
use tessera_common::{Result, TesseraError};
use tracing::{debug, error, warn};

const WORD: usize = 4;

/// Keys returned by one functional index function for one statement.
pub struct FunctionalKeyCache {
    raw: Box<[u8]>,
}

impl FunctionalKeyCache {
    #[inline]
    fn word(&self, i: usize) -> u32 {
        let pos = i * WORD;
        u32::from_le_bytes([
            self.raw[pos],
            self.raw[pos + 1],
            self.raw[pos + 2],
            self.raw[pos + 3],
        ])
    }

    pub fn key_count(&self) -> u32 {
        self.word(0)
    }

    /// The offset table: key count, start of keys `1..N`, key area size.
    pub fn offsets(&self) -> Vec<u32> {
        (0..=self.key_count() as usize).map(|i| self.word(i)).collect()
    }

    /// All keys, concatenated.
    pub fn data(&self) -> &[u8] {
        let table = (self.key_count() as usize + 1) * WORD;
        &self.raw[table..]
    }

    /// Key `index` as a MessagePack array, or `None` past the end.
    pub fn key(&self, index: u32) -> Option<&[u8]> {
        let count = self.key_count();
        if index >= count {
            return None;
        }
        let start = if index == 0 { 0 } else { self.word(index as usize) };
        let end = self.word(index as usize + 1);
        self.data().get(start as usize..end as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> + '_ {
        (0..self.key_count()).filter_map(move |i| self.key(i))
    }

    /// Bytes held by the cache, table included.
    pub fn size(&self) -> usize {
        self.raw.len()
    }
}

impl fmt::Debug for FunctionalKeyCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<String> = self.iter().map(msgpack::to_string).collect();
        f.debug_struct("FunctionalKeyCache")
            .field("keys", &keys)
            .finish()
    }
}

/// Parses a function result into a cache.
///
/// `result` must be an array of key arrays. With `validate`, each key is
/// checked against `key_def` and more than one key requires a multikey
/// definition.
fn prepare(func_name: &str, key_def: &KeyDef, result: &[u8], validate: bool) -> Result<FunctionalKeyCache> {
    let invalid = |message: &str| TesseraError::FunctionalExtractor {
        func: func_name.to_string(),
        message: message.to_string(),
    };

    let mut cursor = result;
    if msgpack::peek_type(cursor)? != MpType::Array {
        return Err(invalid("returned key type is invalid"));
    }
    let count = msgpack::decode_array_len(&mut cursor)?;
    if validate && count > 1 && !key_def.is_multikey() {
        return Err(invalid("too many keys were returned"));
    }

    // Every key takes at least one byte.
    if count as usize > cursor.len() {
        return Err(invalid("returned key count exceeds the result size"));
    }

    let keys_start = cursor;
    let mut offsets: SmallVec<[u32; 8]> = SmallVec::new();
    offsets.push(count);
    for i in 0..count {
        if msgpack::peek_type(cursor)? != MpType::Array {
            return Err(invalid("returned key type is invalid"));
        }
        let offset = (keys_start.len() - cursor.len()) as u32;
        if i > 0 {
            offsets.push(offset);
        }
        if validate {
            let part_count = msgpack::decode_array_len(&mut cursor)?;
            let parts_size = key_def::exact_key_validate(key_def, cursor, part_count)
                .map_err(|e| invalid(&e.errmsg()))?;
            cursor = &cursor[parts_size..];
        } else {
            msgpack::skip(&mut cursor)?;
        }
    }
    let keys_size = keys_start.len() - cursor.len();
    offsets.push(keys_size as u32);
    if count == 0 {
        // [0] alone: the count doubles as the empty key area size.
        offsets.truncate(1);
    }

    let table_size = offsets.len() * WORD;
    let size = table_size + keys_size;
    let mut raw = Vec::new();
    raw.try_reserve_exact(size)
        .map_err(|_| TesseraError::OutOfMemory {
            size,
            allocator: "malloc",
            object: "functional key cache",
        })?;
    for word in &offsets {
        raw.extend_from_slice(&word.to_le_bytes());
    }
    raw.extend_from_slice(&keys_start[..keys_size]);
    Ok(FunctionalKeyCache {
        raw: raw.into_boxed_slice(),
    })
}

/// Calls the handle's function on `stmt` and parses the result.
fn compute(stmt: &Stmt, handle: &FunctionalHandle, validate: bool) -> Result<FunctionalKeyCache> {
    let func: Arc<dyn Func> = handle.resolve(stmt.format().funcs())?;
    let name = func.def().name.as_str();
    let attribute = |e: TesseraError| TesseraError::FunctionalExtractor {
        func: name.to_string(),
        message: e.errmsg(),
    };
    let result = func
        .call(&Port::Tuples(vec![stmt.clone()]))
        .and_then(|port| port.get_msgpack())
        .map_err(attribute)?;
    prepare(name, handle.key_def(), &result, validate)
}

/// Computes, validates and attaches the keys of every functional index of
/// the statement's format.
///
/// All or nothing: if any function fails, entries attached by this call are
/// detached and entries they replaced are restored.
pub fn materialize(stmt: &Stmt) -> Result<()> {
    let format = stmt.format();
    let handles = format.functional_handles();
    if handles.is_empty() {
        return Ok(());
    }
    let _guard = stmt.begin_materialize()?;
    let vtab = format.vtab();

    let mut attached: SmallVec<[(u32, Option<Arc<FunctionalKeyCache>>); 2]> = SmallVec::new();
    for handle in handles {
        match compute(stmt, handle, true) {
            Ok(cache) => {
                let replaced = vtab.extra_attach(stmt, handle.fid(), Arc::new(cache));
                attached.push((handle.fid(), replaced));
            }
            Err(err) => {
                warn!(
                    fid = handle.fid(),
                    format_id = format.id(),
                    rolled_back = attached.len(),
                    error = %err,
                    "functional key materialization failed"
                );
                for (fid, replaced) in attached.into_iter().rev() {
                    vtab.extra_detach(stmt, fid);
                    if let Some(previous) = replaced {
                        vtab.extra_attach(stmt, fid, previous);
                    }
                }
                return Err(err);
            }
        }
    }
    debug!(
        format_id = format.id(),
        handles = handles.len(),
        "functional keys materialized"
    );
    Ok(())
}

/// Detaches every functional key cache entry of the statement's format.
pub fn terminate(stmt: &Stmt) {
    let format = stmt.format();
    for handle in format.functional_handles() {
        format.vtab().extra_detach(stmt, handle.fid());
    }
}

/// Returns the cached keys of function `fid` for `stmt`.
///
/// A missing entry is rebuilt without validation and attached.
///
/// # Panics
///
/// Panics if the keys cannot be rebuilt. Callers outside recovery must have
/// materialized the statement first.
pub fn key_get(stmt: &Stmt, fid: u32) -> Arc<FunctionalKeyCache> {
    let format = stmt.format();
    if let Some(cache) = format.vtab().extra_lookup(stmt, fid) {
        return cache;
    }
    let rebuilt = format
        .functional_handle(fid)
        .ok_or_else(|| TesseraError::NoSuchFunction(fid.to_string()))
        .and_then(|handle| compute(stmt, handle, false));
    match rebuilt {
        Ok(cache) => {
            let cache = Arc::new(cache);
            format.vtab().extra_attach(stmt, fid, cache.clone());
            cache
        }
        Err(e) => {
            error!(fid, format_id = format.id(), error = %e, "functional key cannot be rebuilt");
            panic!("Functional index runtime exception: {}", e);
        }
    }
}
