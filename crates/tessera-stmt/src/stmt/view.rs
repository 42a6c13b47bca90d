//! Zero-copy view shared by heap and region statements.

use super::header::StmtHeader;
use crate::field_map::{self, FieldMap};
use crate::format::TupleFormat;
use crate::key_def::KeyPart;
use crate::msgpack;
use std::fmt;
use tessera_common::{Lsn, Result, StmtFlags, StmtType};

/// Borrowed view of an encoded statement.
#[derive(Clone, Copy)]
pub struct StmtView<'a> {
    header: StmtHeader,
    raw: &'a [u8],
    format: &'a TupleFormat,
}

impl<'a> StmtView<'a> {
    /// Wraps the encoded statement `raw` built against `format`.
    #[inline]
    pub fn new(raw: &'a [u8], format: &'a TupleFormat) -> Self {
        let header = StmtHeader::from_bytes(raw);
        debug_assert_eq!(header.size(), raw.len());
        Self {
            header,
            raw,
            format,
        }
    }

    #[inline]
    pub fn header(&self) -> &StmtHeader {
        &self.header
    }

    #[inline]
    pub fn format(&self) -> &'a TupleFormat {
        self.format
    }

    #[inline]
    pub fn stmt_type(&self) -> StmtType {
        self.header.stmt_type
    }

    #[inline]
    pub fn lsn(&self) -> Lsn {
        self.header.lsn
    }

    #[inline]
    pub fn flags(&self) -> StmtFlags {
        self.header.flags
    }

    /// Payload size, upsert operations included.
    #[inline]
    pub fn bsize(&self) -> u32 {
        self.header.bsize
    }

    #[inline]
    pub fn data_offset(&self) -> u16 {
        self.header.data_offset
    }

    /// Total size of the encoded statement.
    #[inline]
    pub fn size(&self) -> usize {
        self.raw.len()
    }

    /// The whole encoded statement.
    #[inline]
    pub fn raw(&self) -> &'a [u8] {
        self.raw
    }

    /// True if the statement is a bare key.
    #[inline]
    pub fn is_key(&self) -> bool {
        self.format.is_key()
    }

    /// Payload, upsert operations included.
    #[inline]
    pub fn data(&self) -> &'a [u8] {
        &self.raw[self.header.data_offset as usize..]
    }

    /// Payload tuple without trailing upsert operations.
    pub fn upsert_data(&self) -> &'a [u8] {
        let data = self.data();
        if self.stmt_type() != StmtType::Upsert {
            return data;
        }
        match msgpack::value_span(data) {
            Ok(span) => &data[..span],
            Err(_) => data,
        }
    }

    /// Trailing upsert operations, empty for other types.
    pub fn upsert_ops(&self) -> &'a [u8] {
        let data = self.data();
        &data[self.upsert_data().len()..]
    }

    pub fn field_map(&self) -> FieldMap<'a> {
        FieldMap::new(&self.raw[StmtHeader::SIZE..self.header.data_offset as usize])
    }

    /// Number of top-level fields of the payload tuple.
    pub fn field_count(&self) -> Result<u32> {
        let mut cursor = self.upsert_data();
        msgpack::decode_array_len(&mut cursor)
    }

    /// Raw bytes of top-level field `fieldno`.
    pub fn field(&self, fieldno: u32) -> Result<Option<&'a [u8]>> {
        field_map::locate_field(
            self.upsert_data(),
            Some((self.format, self.field_map())),
            fieldno,
            &[],
            None,
        )
    }

    /// Raw bytes of the field a key part points at.
    pub fn field_by_part(&self, part: &KeyPart, multikey_idx: Option<u32>) -> Result<Option<&'a [u8]>> {
        let path = part.path.as_ref().map(|p| p.tokens()).unwrap_or(&[]);
        field_map::locate_field(
            self.upsert_data(),
            Some((self.format, self.field_map())),
            part.fieldno,
            path,
            multikey_idx,
        )
    }
}

impl fmt::Display for StmtView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tuple = msgpack::to_string(self.upsert_data());
        match self.stmt_type() {
            StmtType::Unset => f.write_str(&tuple),
            StmtType::Upsert => {
                let mut ops = String::new();
                let mut cursor = self.upsert_ops();
                while !cursor.is_empty() {
                    if !ops.is_empty() {
                        ops.push_str(", ");
                    }
                    if msgpack::format_value(&mut cursor, &mut ops).is_err() {
                        ops.push_str("<invalid msgpack>");
                        break;
                    }
                }
                write!(f, "UPSERT({}, ops={}, lsn={})", tuple, ops, self.lsn())
            }
            other => write!(f, "{}({}, lsn={})", other.name(), tuple, self.lsn()),
        }
    }
}

impl fmt::Debug for StmtView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StmtView")
            .field("header", &self.header)
            .field("format_id", &self.format.id())
            .field("stmt", &self.to_string())
            .finish()
    }
}
