//! Key definitions: ordered key parts, field types and JSON paths.

use crate::msgpack::{self, MpType};
use smallvec::SmallVec;
use std::fmt;
use tessera_common::{Result, TesseraError};

/// Field type of an indexed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Any,
    Unsigned,
    String,
    Number,
    Double,
    Integer,
    Boolean,
    Varbinary,
    Scalar,
    Array,
    Map,
}

impl FieldType {
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::Any => "any",
            FieldType::Unsigned => "unsigned",
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Double => "double",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Varbinary => "varbinary",
            FieldType::Scalar => "scalar",
            FieldType::Array => "array",
            FieldType::Map => "map",
        }
    }

    /// Returns true if a value of type `mp` may be stored in this field.
    /// Nil is never compatible; nullability is checked separately.
    pub fn is_compatible(&self, mp: MpType) -> bool {
        match self {
            FieldType::Any => mp != MpType::Nil,
            FieldType::Unsigned => mp == MpType::Uint,
            FieldType::String => mp == MpType::Str,
            FieldType::Integer => matches!(mp, MpType::Uint | MpType::Int),
            FieldType::Number => matches!(
                mp,
                MpType::Uint | MpType::Int | MpType::Float | MpType::Double
            ),
            FieldType::Double => matches!(mp, MpType::Float | MpType::Double),
            FieldType::Boolean => mp == MpType::Bool,
            FieldType::Varbinary => mp == MpType::Bin,
            FieldType::Scalar => !matches!(mp, MpType::Nil | MpType::Array | MpType::Map),
            FieldType::Array => mp == MpType::Array,
            FieldType::Map => mp == MpType::Map,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One step of a JSON path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathToken {
    /// Zero-based array index (written 1-based as `[N]`).
    Num(u32),
    /// Map key.
    Str(String),
    /// Multikey wildcard `[*]`.
    Any,
}

/// Parsed path into a nested document field.
///
/// Syntax: `.name`, `["name"]`, `[N]` (1-based) and `[*]`; a leading
/// identifier may omit the dot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct JsonPath {
    tokens: SmallVec<[PathToken; 4]>,
}

impl JsonPath {
    /// Parses `path`.
    pub fn parse(path: &str) -> Result<Self> {
        let err = |reason: &str| TesseraError::InvalidJsonPath {
            path: path.to_string(),
            reason: reason.to_string(),
        };
        let bytes = path.as_bytes();
        let mut tokens = SmallVec::new();
        let mut pos = 0;
        let mut any_seen = false;

        while pos < bytes.len() {
            match bytes[pos] {
                b'.' => {
                    pos += 1;
                    let (name, next) = identifier(path, pos).ok_or_else(|| err("expected field name"))?;
                    tokens.push(PathToken::Str(name.to_string()));
                    pos = next;
                }
                b'[' => {
                    pos += 1;
                    match bytes.get(pos) {
                        Some(b'*') => {
                            if any_seen {
                                return Err(err("more than one [*]"));
                            }
                            any_seen = true;
                            tokens.push(PathToken::Any);
                            pos += 1;
                        }
                        Some(&q) if q == b'"' || q == b'\'' => {
                            let start = pos + 1;
                            let len = path[start..]
                                .find(q as char)
                                .ok_or_else(|| err("unterminated string"))?;
                            if len == 0 {
                                return Err(err("empty field name"));
                            }
                            tokens.push(PathToken::Str(path[start..start + len].to_string()));
                            pos = start + len + 1;
                        }
                        Some(b) if b.is_ascii_digit() => {
                            let start = pos;
                            while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                                pos += 1;
                            }
                            let index: u32 = path[start..pos]
                                .parse()
                                .map_err(|_| err("index is too large"))?;
                            if index == 0 {
                                return Err(err("indexes are 1-based"));
                            }
                            tokens.push(PathToken::Num(index - 1));
                        }
                        _ => return Err(err("expected index, string or *")),
                    }
                    if bytes.get(pos) != Some(&b']') {
                        return Err(err("expected ]"));
                    }
                    pos += 1;
                }
                _ if pos == 0 => {
                    let (name, next) = identifier(path, pos).ok_or_else(|| err("expected field name"))?;
                    tokens.push(PathToken::Str(name.to_string()));
                    pos = next;
                }
                _ => return Err(err("unexpected character")),
            }
        }
        if tokens.is_empty() {
            return Err(err("path is empty"));
        }
        Ok(Self { tokens })
    }

    pub fn tokens(&self) -> &[PathToken] {
        &self.tokens
    }

    /// Returns true if the path contains `[*]`.
    pub fn is_multikey(&self) -> bool {
        self.tokens.iter().any(|t| *t == PathToken::Any)
    }

    /// Tokens before the `[*]`, or `None` for a plain path.
    pub fn multikey_prefix(&self) -> Option<&[PathToken]> {
        let pos = self.tokens.iter().position(|t| *t == PathToken::Any)?;
        Some(&self.tokens[..pos])
    }
}

fn identifier(path: &str, start: usize) -> Option<(&str, usize)> {
    let bytes = path.as_bytes();
    let mut end = start;
    while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_') {
        end += 1;
    }
    if end == start || bytes[start].is_ascii_digit() {
        return None;
    }
    Some((&path[start..end], end))
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for token in &self.tokens {
            match token {
                PathToken::Num(n) => write!(f, "[{}]", n + 1)?,
                PathToken::Str(s) => write!(f, ".{}", s)?,
                PathToken::Any => f.write_str("[*]")?,
            }
        }
        Ok(())
    }
}

/// One ordered component of a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPart {
    /// Zero-based top-level field number.
    pub fieldno: u32,
    pub field_type: FieldType,
    pub is_nullable: bool,
    pub path: Option<JsonPath>,
}

impl KeyPart {
    pub fn new(fieldno: u32, field_type: FieldType) -> Self {
        Self {
            fieldno,
            field_type,
            is_nullable: false,
            path: None,
        }
    }

    /// Marks the part nullable.
    pub fn nullable(mut self) -> Self {
        self.is_nullable = true;
        self
    }

    /// Attaches a JSON path into the top-level field.
    pub fn with_path(mut self, path: &str) -> Result<Self> {
        self.path = Some(JsonPath::parse(path)?);
        Ok(self)
    }

    /// Returns true if the path runs through `[*]`.
    pub fn is_multikey(&self) -> bool {
        self.path.as_ref().is_some_and(|p| p.is_multikey())
    }
}

/// Ordered list of key parts plus multikey/functional markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDef {
    parts: Vec<KeyPart>,
    is_multikey: bool,
    func_id: Option<u32>,
}

impl KeyDef {
    /// Creates a key definition over tuple fields.
    ///
    /// All multikey parts must share one `[*]` prefix.
    pub fn new(parts: Vec<KeyPart>) -> Result<Self> {
        if parts.is_empty() {
            return Err(TesseraError::InvalidKeyDef(
                "key definition must have at least one part".to_string(),
            ));
        }
        let mut multikey: Option<(u32, &[PathToken])> = None;
        for part in &parts {
            let prefix = match part.path.as_ref().and_then(|p| p.multikey_prefix()) {
                Some(prefix) => prefix,
                None => continue,
            };
            match multikey {
                None => multikey = Some((part.fieldno, prefix)),
                Some((fieldno, first)) if fieldno == part.fieldno && first == prefix => {}
                Some(_) => {
                    return Err(TesseraError::InvalidKeyDef(
                        "all multikey parts must share one [*] path prefix".to_string(),
                    ))
                }
            }
        }
        let is_multikey = multikey.is_some();
        Ok(Self {
            parts,
            is_multikey,
            func_id: None,
        })
    }

    /// Creates a functional key definition whose parts describe the keys
    /// returned by function `func_id`.
    pub fn functional(func_id: u32, parts: Vec<KeyPart>, is_multikey: bool) -> Result<Self> {
        if parts.is_empty() {
            return Err(TesseraError::InvalidKeyDef(
                "key definition must have at least one part".to_string(),
            ));
        }
        if parts.iter().any(|p| p.path.is_some()) {
            return Err(TesseraError::InvalidKeyDef(
                "functional key parts cannot have JSON paths".to_string(),
            ));
        }
        Ok(Self {
            parts,
            is_multikey,
            func_id: Some(func_id),
        })
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.parts
    }

    pub fn part_count(&self) -> u32 {
        self.parts.len() as u32
    }

    pub fn is_multikey(&self) -> bool {
        self.is_multikey
    }

    pub fn func_id(&self) -> Option<u32> {
        self.func_id
    }

    pub fn is_functional(&self) -> bool {
        self.func_id.is_some()
    }
}

/// Checks that `key` (the elements of a key array, without its header)
/// holds exactly `part_count` parts matching `key_def`.
///
/// Returns the number of bytes the parts span.
pub fn exact_key_validate(key_def: &KeyDef, key: &[u8], part_count: u32) -> Result<usize> {
    if part_count != key_def.part_count() {
        return Err(TesseraError::ExactMatch {
            expected: key_def.part_count(),
            actual: part_count,
        });
    }
    let mut cursor = key;
    for (i, part) in key_def.parts().iter().enumerate() {
        let mp = msgpack::peek_type(cursor)?;
        let nil_ok = mp == MpType::Nil && part.is_nullable;
        if !nil_ok && !part.field_type.is_compatible(mp) {
            return Err(TesseraError::KeyPartType {
                part: i as u32,
                expected: part.field_type.name().to_string(),
            });
        }
        msgpack::skip(&mut cursor)?;
    }
    Ok(key.len() - cursor.len())
}
