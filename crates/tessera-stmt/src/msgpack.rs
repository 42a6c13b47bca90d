//! MessagePack cursor helpers over raw byte slices.
//!
//! Statements keep their payload as untouched MessagePack, so most work is
//! skipping values and reading container headers in place. Encoding goes
//! through `rmp::encode` into growable buffers; decoding goes through
//! `rmp::decode` and advances a `&mut &[u8]` cursor. `skip` walks nested
//! containers itself since `rmp` has no value skipper.

use rmp::decode;
use rmp::Marker;
use std::fmt::{self, Write as _};
use tessera_common::{Result, TesseraError};

/// Coarse MessagePack value type, as seen from the leading marker byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpType {
    Nil,
    Uint,
    Int,
    Str,
    Bin,
    Array,
    Map,
    Bool,
    Float,
    Double,
    Ext,
}

impl MpType {
    /// Returns the lower-case type name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            MpType::Nil => "nil",
            MpType::Uint => "unsigned",
            MpType::Int => "integer",
            MpType::Str => "string",
            MpType::Bin => "varbinary",
            MpType::Array => "array",
            MpType::Map => "map",
            MpType::Bool => "boolean",
            MpType::Float => "float",
            MpType::Double => "double",
            MpType::Ext => "extension",
        }
    }
}

/// Returns the type of the value starting with `byte`.
#[inline]
pub fn mp_typeof(byte: u8) -> MpType {
    match Marker::from_u8(byte) {
        Marker::Null => MpType::Nil,
        Marker::True | Marker::False => MpType::Bool,
        Marker::FixPos(_) | Marker::U8 | Marker::U16 | Marker::U32 | Marker::U64 => MpType::Uint,
        Marker::FixNeg(_) | Marker::I8 | Marker::I16 | Marker::I32 | Marker::I64 => MpType::Int,
        Marker::F32 => MpType::Float,
        Marker::F64 => MpType::Double,
        Marker::FixStr(_) | Marker::Str8 | Marker::Str16 | Marker::Str32 => MpType::Str,
        Marker::Bin8 | Marker::Bin16 | Marker::Bin32 => MpType::Bin,
        Marker::FixArray(_) | Marker::Array16 | Marker::Array32 => MpType::Array,
        Marker::FixMap(_) | Marker::Map16 | Marker::Map32 => MpType::Map,
        _ => MpType::Ext,
    }
}

/// Returns the type of the first value in `buf`.
pub fn peek_type(buf: &[u8]) -> Result<MpType> {
    buf.first()
        .map(|b| mp_typeof(*b))
        .ok_or_else(|| invalid("unexpected end of data"))
}

/// Number of bytes taken by an array header with `len` elements.
#[inline]
pub fn sizeof_array(len: u32) -> usize {
    if len < 16 {
        1
    } else if len <= u16::MAX as u32 {
        3
    } else {
        5
    }
}

fn invalid(reason: &str) -> TesseraError {
    TesseraError::InvalidMsgPack(reason.to_string())
}

fn decode_err(err: impl fmt::Display) -> TesseraError {
    TesseraError::InvalidMsgPack(err.to_string())
}

#[inline]
fn take<'a>(buf: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
    if buf.len() < len {
        return Err(invalid("unexpected end of data"));
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

#[inline]
fn peek_marker(buf: &[u8]) -> Result<Marker> {
    buf.first()
        .map(|b| Marker::from_u8(*b))
        .ok_or_else(|| invalid("unexpected end of data"))
}

/// Decodes an array header and returns the element count.
pub fn decode_array_len(buf: &mut &[u8]) -> Result<u32> {
    decode::read_array_len(buf).map_err(decode_err)
}

/// Decodes a map header and returns the number of key/value pairs.
pub fn decode_map_len(buf: &mut &[u8]) -> Result<u32> {
    decode::read_map_len(buf).map_err(decode_err)
}

/// Decodes a non-negative integer.
pub fn decode_uint(buf: &mut &[u8]) -> Result<u64> {
    decode::read_int(buf).map_err(decode_err)
}

/// Decodes any integer that fits into i64.
pub fn decode_int(buf: &mut &[u8]) -> Result<i64> {
    decode::read_int(buf).map_err(decode_err)
}

/// Decodes a UTF-8 string in place.
pub fn decode_str<'a>(buf: &mut &'a [u8]) -> Result<&'a str> {
    let (s, tail) = decode::read_str_from_slice(*buf).map_err(decode_err)?;
    *buf = tail;
    Ok(s)
}

/// Payload bytes following a fixed-width scalar marker.
fn scalar_width(marker: Marker) -> usize {
    match marker {
        Marker::U8 | Marker::I8 => 1,
        Marker::U16 | Marker::I16 => 2,
        Marker::U32 | Marker::I32 | Marker::F32 => 4,
        Marker::U64 | Marker::I64 | Marker::F64 => 8,
        _ => 0,
    }
}

/// Advances `buf` past exactly one value, nested containers included.
pub fn skip(buf: &mut &[u8]) -> Result<()> {
    let mut pending: u64 = 1;
    while pending > 0 {
        pending -= 1;
        match peek_marker(buf)? {
            Marker::FixArray(_) | Marker::Array16 | Marker::Array32 => {
                pending += u64::from(decode_array_len(buf)?);
            }
            Marker::FixMap(_) | Marker::Map16 | Marker::Map32 => {
                pending += 2 * u64::from(decode_map_len(buf)?);
            }
            Marker::FixStr(_) | Marker::Str8 | Marker::Str16 | Marker::Str32 => {
                let len = decode::read_str_len(buf).map_err(decode_err)?;
                take(buf, len as usize)?;
            }
            Marker::Bin8 | Marker::Bin16 | Marker::Bin32 => {
                let len = decode::read_bin_len(buf).map_err(decode_err)?;
                take(buf, len as usize)?;
            }
            Marker::FixExt1
            | Marker::FixExt2
            | Marker::FixExt4
            | Marker::FixExt8
            | Marker::FixExt16
            | Marker::Ext8
            | Marker::Ext16
            | Marker::Ext32 => {
                let meta = decode::read_ext_meta(buf).map_err(decode_err)?;
                take(buf, meta.size as usize)?;
            }
            Marker::Reserved => return Err(invalid("reserved marker 0xc1")),
            scalar => {
                take(buf, 1 + scalar_width(scalar))?;
            }
        }
    }
    Ok(())
}

/// Returns the encoded size of the first value in `buf`.
pub fn value_span(buf: &[u8]) -> Result<usize> {
    let mut cursor = buf;
    skip(&mut cursor)?;
    Ok(buf.len() - cursor.len())
}

/// Returns the encoded size of `count` consecutive values.
pub fn values_span(buf: &[u8], count: u32) -> Result<usize> {
    let mut cursor = buf;
    for _ in 0..count {
        skip(&mut cursor)?;
    }
    Ok(buf.len() - cursor.len())
}

/// Checks that `buf` holds exactly one well-formed array.
pub fn check_array(buf: &[u8]) -> Result<()> {
    if peek_type(buf)? != MpType::Array {
        return Err(invalid("expected array"));
    }
    if value_span(buf)? != buf.len() {
        return Err(invalid("junk after tuple"));
    }
    Ok(())
}

/// Appends a human-readable rendering of the first value of `buf` to `out`.
pub fn format_value(buf: &mut &[u8], out: &mut String) -> Result<()> {
    match peek_type(buf)? {
        MpType::Nil => {
            decode::read_nil(buf).map_err(decode_err)?;
            out.push_str("null");
        }
        MpType::Bool => {
            let v = decode::read_bool(buf).map_err(decode_err)?;
            out.push_str(if v { "true" } else { "false" });
        }
        MpType::Uint => {
            let v = decode_uint(buf)?;
            let _ = write!(out, "{}", v);
        }
        MpType::Int => {
            let v = decode_int(buf)?;
            let _ = write!(out, "{}", v);
        }
        MpType::Float => {
            let v = decode::read_f32(buf).map_err(decode_err)?;
            let _ = write!(out, "{}", v);
        }
        MpType::Double => {
            let v = decode::read_f64(buf).map_err(decode_err)?;
            let _ = write!(out, "{}", v);
        }
        MpType::Str => {
            let s = decode_str(buf)?;
            let _ = write!(out, "{:?}", s);
        }
        MpType::Array => {
            let len = decode_array_len(buf)?;
            out.push('[');
            for i in 0..len {
                if i > 0 {
                    out.push_str(", ");
                }
                format_value(buf, out)?;
            }
            out.push(']');
        }
        MpType::Map => {
            let len = decode_map_len(buf)?;
            out.push('{');
            for i in 0..len {
                if i > 0 {
                    out.push_str(", ");
                }
                format_value(buf, out)?;
                out.push_str(": ");
                format_value(buf, out)?;
            }
            out.push('}');
        }
        MpType::Bin | MpType::Ext => {
            let span = value_span(buf)?;
            take(buf, span)?;
            let _ = write!(out, "<{} bytes>", span);
        }
    }
    Ok(())
}

/// Renders one value as a string, or a placeholder if it is malformed.
pub fn to_string(buf: &[u8]) -> String {
    let mut out = String::new();
    let mut cursor = buf;
    if format_value(&mut cursor, &mut out).is_err() {
        return "<invalid msgpack>".to_string();
    }
    out
}
