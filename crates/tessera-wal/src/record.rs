//! Wire record format.

use crate::constants::*;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tessera_common::{Lsn, Result, StmtType, TesseraError};
use tessera_stmt::msgpack::{self, MpType};

/// One DML request as written to the log.
///
/// Record format:
/// - header (16 bytes):
///   - lsn: 8 bytes
///   - request type: 1 byte
///   - reserved: 3 bytes
///   - body_len: 4 bytes
/// - body: MessagePack map keyed by request keys
/// - checksum: 4 bytes (CRC32 of header + body)
///
/// Byte fields hold exactly one encoded MessagePack value each.
#[derive(Debug, Clone, PartialEq)]
pub struct WireRecord {
    pub stmt_type: StmtType,
    pub lsn: Lsn,
    pub space_id: Option<u32>,
    pub index_id: Option<u32>,
    pub key: Option<Bytes>,
    pub tuple: Option<Bytes>,
    pub ops: Option<Bytes>,
    /// Encoded `{META_FLAGS: flags}` map.
    pub tuple_meta: Option<Bytes>,
}

impl WireRecord {
    pub fn new(stmt_type: StmtType, lsn: Lsn) -> Self {
        Self {
            stmt_type,
            lsn,
            space_id: None,
            index_id: None,
            key: None,
            tuple: None,
            ops: None,
            tuple_meta: None,
        }
    }

    fn body_fields(&self) -> [(u8, Option<&Bytes>); 4] {
        [
            (KEY_KEY, self.key.as_ref()),
            (KEY_TUPLE, self.tuple.as_ref()),
            (KEY_OPS, self.ops.as_ref()),
            (KEY_TUPLE_META, self.tuple_meta.as_ref()),
        ]
    }

    fn encode_body(&self) -> Result<Vec<u8>> {
        let ids = [(KEY_SPACE_ID, self.space_id), (KEY_INDEX_ID, self.index_id)];
        let fields = self.body_fields();
        let count = ids.iter().filter(|(_, v)| v.is_some()).count()
            + fields.iter().filter(|(_, v)| v.is_some()).count();

        let mut body = Vec::new();
        rmp::encode::write_map_len(&mut body, count as u32)?;
        for (key, value) in ids {
            if let Some(value) = value {
                rmp::encode::write_uint(&mut body, u64::from(key))?;
                rmp::encode::write_uint(&mut body, u64::from(value))?;
            }
        }
        for (key, value) in fields {
            if let Some(value) = value {
                rmp::encode::write_uint(&mut body, u64::from(key))?;
                body.extend_from_slice(value);
            }
        }
        Ok(body)
    }

    /// Serializes this record to bytes.
    pub fn serialize(&self) -> Result<Bytes> {
        let body = self.encode_body()?;
        if body.len() > MAX_BODY_SIZE {
            return Err(TesseraError::InvalidRecord(format!(
                "body too large: {}",
                body.len()
            )));
        }
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len() + CHECKSUM_SIZE);

        // Write header
        buf.put_i64_le(self.lsn);
        buf.put_u8(self.stmt_type as u8);
        buf.put_bytes(0, 3);
        buf.put_u32_le(body.len() as u32);

        // Write body
        buf.put_slice(&body);

        // Compute and write checksum
        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);

        Ok(buf.freeze())
    }

    /// Deserializes a record from bytes.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE + CHECKSUM_SIZE {
            return Err(TesseraError::WalCorrupted {
                lsn: 0,
                reason: "record too short".to_string(),
            });
        }

        // Read header
        let mut header = &data[..HEADER_SIZE];
        let lsn = header.get_i64_le();
        debug_assert_eq!(HEADER_SIZE - header.len(), OFF_REQUEST_TYPE);
        let type_byte = header.get_u8();
        header.advance(OFF_BODY_LEN - OFF_REQUEST_TYPE - 1);
        let body_len = header.get_u32_le() as usize;

        if body_len > MAX_BODY_SIZE {
            return Err(TesseraError::WalCorrupted {
                lsn,
                reason: format!("body too large: {}", body_len),
            });
        }
        if data.len() < HEADER_SIZE + body_len + CHECKSUM_SIZE {
            return Err(TesseraError::WalCorrupted {
                lsn,
                reason: "truncated record".to_string(),
            });
        }

        // Verify checksum
        let framed = &data[..HEADER_SIZE + body_len];
        let stored_checksum = (&data[HEADER_SIZE + body_len..]).get_u32_le();
        let computed_checksum = crc32fast::hash(framed);
        if stored_checksum != computed_checksum {
            return Err(TesseraError::WalCorrupted {
                lsn,
                reason: format!(
                    "checksum mismatch: stored={}, computed={}",
                    stored_checksum, computed_checksum
                ),
            });
        }

        let stmt_type = StmtType::try_from(type_byte).map_err(|e| at_lsn(lsn, e))?;
        let mut record = Self::new(stmt_type, lsn);
        record
            .decode_body(&data[HEADER_SIZE..HEADER_SIZE + body_len])
            .map_err(|e| at_lsn(lsn, e))?;
        Ok(record)
    }

    fn decode_body(&mut self, body: &[u8]) -> Result<()> {
        let mut cursor = body;
        let count = msgpack::decode_map_len(&mut cursor)?;
        for _ in 0..count {
            if msgpack::peek_type(cursor)? != MpType::Uint {
                return Err(TesseraError::InvalidRecord(
                    "request key must be unsigned".to_string(),
                ));
            }
            let key = msgpack::decode_uint(&mut cursor)?;
            let span = msgpack::value_span(cursor)?;
            let value = Bytes::copy_from_slice(&cursor[..span]);
            match u8::try_from(key) {
                Ok(KEY_SPACE_ID) => self.space_id = Some(decode_id(&value)?),
                Ok(KEY_INDEX_ID) => self.index_id = Some(decode_id(&value)?),
                Ok(KEY_KEY) => self.key = Some(value),
                Ok(KEY_TUPLE) => self.tuple = Some(value),
                Ok(KEY_OPS) => self.ops = Some(value),
                Ok(KEY_TUPLE_META) => self.tuple_meta = Some(value),
                _ => {}
            }
            cursor = &cursor[span..];
        }
        if !cursor.is_empty() {
            return Err(TesseraError::InvalidRecord(
                "junk after request body".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the total size of this record once serialized.
    pub fn size_on_disk(&self) -> Result<usize> {
        Ok(HEADER_SIZE + self.encode_body()?.len() + CHECKSUM_SIZE)
    }
}

fn decode_id(mut value: &[u8]) -> Result<u32> {
    let id = msgpack::decode_uint(&mut value)?;
    u32::try_from(id).map_err(|_| TesseraError::InvalidRecord(format!("id out of range: {}", id)))
}

/// Prefixes record-level errors with the offending LSN.
fn at_lsn(lsn: Lsn, err: TesseraError) -> TesseraError {
    match err {
        TesseraError::InvalidRecord(reason) => {
            TesseraError::InvalidRecord(format!("lsn {}: {}", lsn, reason))
        }
        other => other,
    }
}
