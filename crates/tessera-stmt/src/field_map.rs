//! Field maps: per-statement tables of offsets to indexed fields.
//!
//! A field map sits between the statement header and the payload. Slot `i`
//! occupies the 4 bytes ending `4 * i` bytes before the payload, so slots
//! grow backward from the data. A slot holds the offset of its field from
//! the start of the payload, or 0 if the field is absent.

use crate::format::{TupleField, TupleFormat};
use crate::key_def::PathToken;
use crate::msgpack::{self, MpType};
use smallvec::SmallVec;
use std::fmt::Write as _;
use tessera_common::{Result, TesseraError};

/// Offsets collected while walking a payload.
#[derive(Debug, Clone)]
pub struct FieldMapBuilder {
    slots: SmallVec<[u32; 8]>,
}

impl FieldMapBuilder {
    pub fn new(slot_count: u32) -> Self {
        Self {
            slots: SmallVec::from_elem(0, slot_count as usize),
        }
    }

    /// Records `offset` for `slot`.
    #[inline]
    pub fn set(&mut self, slot: u32, offset: usize) {
        self.slots[slot as usize] = offset as u32;
    }

    pub fn get(&self, slot: u32) -> Option<u32> {
        self.slots.get(slot as usize).copied().filter(|&o| o != 0)
    }

    pub fn slot_count(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Encoded size in bytes.
    pub fn size(&self) -> usize {
        self.slots.len() * 4
    }

    /// Writes the slots into `dst`, which must be exactly `size()` bytes
    /// and end where the payload begins.
    pub fn build_into(&self, dst: &mut [u8]) {
        debug_assert_eq!(dst.len(), self.size());
        let end = dst.len();
        for (i, offset) in self.slots.iter().enumerate() {
            let pos = end - 4 * (i + 1);
            dst[pos..pos + 4].copy_from_slice(&offset.to_le_bytes());
        }
    }
}

/// Read-only view of an encoded field map.
#[derive(Debug, Clone, Copy)]
pub struct FieldMap<'a> {
    raw: &'a [u8],
}

impl<'a> FieldMap<'a> {
    /// Wraps the bytes between the header and the payload.
    pub fn new(raw: &'a [u8]) -> Self {
        Self { raw }
    }

    pub fn slot_count(&self) -> u32 {
        (self.raw.len() / 4) as u32
    }

    /// Offset stored in `slot`, or `None` if the field is absent.
    pub fn get(&self, slot: u32) -> Option<u32> {
        let slot = slot as usize;
        if (slot + 1) * 4 > self.raw.len() {
            return None;
        }
        let pos = self.raw.len() - 4 * (slot + 1);
        let offset = u32::from_le_bytes([
            self.raw[pos],
            self.raw[pos + 1],
            self.raw[pos + 2],
            self.raw[pos + 3],
        ]);
        (offset != 0).then_some(offset)
    }
}

/// Walks `data` against the format's field tree and records the offset of
/// every field that owns a slot.
///
/// Without `validate`, fields whose type does not match are treated as
/// absent. With `validate`, the field count and types are enforced.
pub fn field_map_create(format: &TupleFormat, data: &[u8], validate: bool) -> Result<FieldMapBuilder> {
    let mut builder = FieldMapBuilder::new(format.slot_count());
    let mut cursor = data;
    let field_count = msgpack::decode_array_len(&mut cursor)?;
    if validate && field_count < format.min_field_count() {
        return Err(TesseraError::MinFieldCount {
            expected: format.min_field_count(),
            actual: field_count,
        });
    }

    let mut path = FieldPath::default();
    let covered = field_count.min(format.index_field_count());
    for (fieldno, field) in format.fields().iter().take(covered as usize).enumerate() {
        let offset = data.len() - cursor.len();
        path.push(PathStep::Index(fieldno as u32));
        visit(field, data, offset, &mut builder, validate, &mut path)?;
        path.pop();
        msgpack::skip(&mut cursor)?;
    }
    Ok(builder)
}

fn visit(
    field: &TupleField,
    data: &[u8],
    offset: usize,
    builder: &mut FieldMapBuilder,
    validate: bool,
    path: &mut FieldPath,
) -> Result<()> {
    let value = &data[offset..];
    let mp = msgpack::peek_type(value)?;
    if mp == MpType::Nil && !field.is_key_part() {
        return Ok(());
    }
    let type_ok = field.field_type().is_compatible(mp) || (mp == MpType::Nil && field.is_nullable());
    if !type_ok {
        if validate {
            return Err(TesseraError::FieldType {
                field: path.describe(),
                expected: field.field_type().name().to_string(),
                actual: mp.name().to_string(),
            });
        }
        return Ok(());
    }
    if let Some(slot) = field.offset_slot() {
        builder.set(slot, offset);
    }
    if field.children().is_empty() {
        return Ok(());
    }

    let mut cursor = value;
    match mp {
        MpType::Array => {
            let len = msgpack::decode_array_len(&mut cursor)?;
            for index in 0..len {
                if let Some(child) = field.child_for_index(index) {
                    let child_offset = data.len() - cursor.len();
                    path.push(PathStep::Index(index));
                    visit(child, data, child_offset, builder, validate, path)?;
                    path.pop();
                } else if !field.is_multikey_array() && index >= field.indexed_element_count() {
                    break;
                }
                msgpack::skip(&mut cursor)?;
            }
        }
        MpType::Map => {
            let len = msgpack::decode_map_len(&mut cursor)?;
            for _ in 0..len {
                let child = if msgpack::peek_type(cursor)? == MpType::Str {
                    let key = msgpack::decode_str(&mut cursor)?;
                    field.child_for_key(key).map(|c| (c, key))
                } else {
                    msgpack::skip(&mut cursor)?;
                    None
                };
                if let Some((child, key)) = child {
                    let child_offset = data.len() - cursor.len();
                    path.push(PathStep::Key(key.to_string()));
                    visit(child, data, child_offset, builder, validate, path)?;
                    path.pop();
                }
                msgpack::skip(&mut cursor)?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[derive(Debug)]
enum PathStep {
    Index(u32),
    Key(String),
}

/// Location of the field being visited, rendered only for diagnostics.
#[derive(Debug, Default)]
struct FieldPath {
    steps: SmallVec<[PathStep; 8]>,
}

impl FieldPath {
    fn push(&mut self, step: PathStep) {
        self.steps.push(step);
    }

    fn pop(&mut self) {
        self.steps.pop();
    }

    fn describe(&self) -> String {
        let mut out = String::new();
        for (depth, step) in self.steps.iter().enumerate() {
            match step {
                PathStep::Index(n) if depth == 0 => {
                    let _ = write!(out, "{}", n + 1);
                }
                PathStep::Index(n) => {
                    let _ = write!(out, "[{}]", n + 1);
                }
                PathStep::Key(k) => {
                    let _ = write!(out, "[\"{}\"]", k);
                }
            }
        }
        out
    }
}

/// Locates the value at `fieldno` + `path` inside `data`.
///
/// Starts from the deepest field map slot on the way when `lookup` is
/// given, otherwise walks from the root. Returns the raw value bytes or
/// `None` if the field is absent.
pub fn locate_field<'a>(
    data: &'a [u8],
    lookup: Option<(&TupleFormat, FieldMap<'_>)>,
    fieldno: u32,
    path: &[PathToken],
    multikey_idx: Option<u32>,
) -> Result<Option<&'a [u8]>> {
    let mut start = None;
    if let Some((format, map)) = lookup {
        if let Some((slot, consumed)) = format.deepest_slot(fieldno, path) {
            match map.get(slot) {
                Some(offset) => start = Some((offset as usize, consumed)),
                None => return Ok(None),
            }
        }
    }

    let (mut pos, rest) = match start {
        Some((offset, consumed)) => (offset, &path[consumed..]),
        None => {
            let mut cursor = data;
            let len = msgpack::decode_array_len(&mut cursor)?;
            if fieldno >= len {
                return Ok(None);
            }
            for _ in 0..fieldno {
                msgpack::skip(&mut cursor)?;
            }
            (data.len() - cursor.len(), path)
        }
    };

    for token in rest {
        let mut cursor = data
            .get(pos..)
            .ok_or_else(|| TesseraError::InvalidMsgPack("field offset out of range".to_string()))?;
        let found = match token {
            PathToken::Num(index) => descend_array(&mut cursor, *index)?,
            PathToken::Any => {
                let index = multikey_idx.ok_or(TesseraError::MultikeyIndexRequired)?;
                descend_array(&mut cursor, index)?
            }
            PathToken::Str(name) => descend_map(&mut cursor, name)?,
        };
        if !found {
            return Ok(None);
        }
        pos = data.len() - cursor.len();
    }

    let value = &data[pos..];
    let span = msgpack::value_span(value)?;
    Ok(Some(&value[..span]))
}

fn descend_array(cursor: &mut &[u8], index: u32) -> Result<bool> {
    if msgpack::peek_type(cursor)? != MpType::Array {
        return Ok(false);
    }
    let len = msgpack::decode_array_len(cursor)?;
    if index >= len {
        return Ok(false);
    }
    for _ in 0..index {
        msgpack::skip(cursor)?;
    }
    Ok(true)
}

fn descend_map(cursor: &mut &[u8], name: &str) -> Result<bool> {
    if msgpack::peek_type(cursor)? != MpType::Map {
        return Ok(false);
    }
    let len = msgpack::decode_map_len(cursor)?;
    for _ in 0..len {
        if msgpack::peek_type(cursor)? == MpType::Str {
            if msgpack::decode_str(cursor)? == name {
                return Ok(true);
            }
        } else {
            msgpack::skip(cursor)?;
        }
        msgpack::skip(cursor)?;
    }
    Ok(false)
}
