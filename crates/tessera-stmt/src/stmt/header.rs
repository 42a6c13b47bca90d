//! Fixed statement header.

use tessera_common::{Lsn, StmtFlags, StmtType, STMT_HEADER_SIZE};

/// Header at the start of every statement.
///
/// Layout (24 bytes, little-endian):
/// - format_id: 2 bytes
/// - type: 1 byte
/// - flags: 1 byte
/// - bsize: 4 bytes (payload size, upsert operations included)
/// - data_offset: 2 bytes (payload start, from the statement base)
/// - reserved: 6 bytes
/// - lsn: 8 bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StmtHeader {
    pub format_id: u16,
    pub stmt_type: StmtType,
    pub flags: StmtFlags,
    pub bsize: u32,
    pub data_offset: u16,
    pub lsn: Lsn,
}

impl StmtHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = STMT_HEADER_SIZE;

    /// Creates a header for a fresh allocation.
    pub fn new(format_id: u16, data_offset: u16, bsize: u32) -> Self {
        Self {
            format_id,
            data_offset,
            bsize,
            ..Default::default()
        }
    }

    /// Total statement size: header, field map and payload.
    #[inline]
    pub fn size(&self) -> usize {
        self.data_offset as usize + self.bsize as usize
    }

    /// Serializes the header to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        self.write_to(&mut buf);
        buf
    }

    /// Writes the header into the first `SIZE` bytes of `buf`.
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.format_id.to_le_bytes());
        buf[2] = self.stmt_type as u8;
        buf[3] = self.flags.0;
        buf[4..8].copy_from_slice(&self.bsize.to_le_bytes());
        buf[8..10].copy_from_slice(&self.data_offset.to_le_bytes());
        buf[10..16].fill(0);
        buf[16..24].copy_from_slice(&self.lsn.to_le_bytes());
    }

    /// Deserializes the header from bytes.
    ///
    /// Headers are only ever written by this crate, so an unknown type byte
    /// reads back as `Unset`.
    pub fn from_bytes(buf: &[u8]) -> Self {
        let mut lsn = [0u8; 8];
        lsn.copy_from_slice(&buf[16..24]);
        Self {
            format_id: u16::from_le_bytes([buf[0], buf[1]]),
            stmt_type: StmtType::try_from(buf[2]).unwrap_or_default(),
            flags: StmtFlags(buf[3]),
            bsize: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            data_offset: u16::from_le_bytes([buf[8], buf[9]]),
            lsn: i64::from_le_bytes(lsn),
        }
    }

    pub(crate) fn set_type(buf: &mut [u8], stmt_type: StmtType) {
        buf[2] = stmt_type as u8;
    }

    pub(crate) fn set_flags(buf: &mut [u8], flags: StmtFlags) {
        buf[3] = flags.0;
    }

    pub(crate) fn set_lsn(buf: &mut [u8], lsn: Lsn) {
        buf[16..24].copy_from_slice(&lsn.to_le_bytes());
    }
}
