//! Wire record constants: header layout and request body keys.

// Record header constants

/// Size of the record header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Size of the checksum in bytes.
pub const CHECKSUM_SIZE: usize = 4;

/// Maximum body size (16 MB).
pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

// Header field offsets

/// Offset of LSN field in header.
pub const OFF_LSN: usize = 0;

/// Offset of request type field in header.
pub const OFF_REQUEST_TYPE: usize = 8;

/// Offset of body length field in header.
pub const OFF_BODY_LEN: usize = 12;

// Request body keys

pub const KEY_SPACE_ID: u8 = 0x10;
pub const KEY_INDEX_ID: u8 = 0x11;
pub const KEY_KEY: u8 = 0x20;
pub const KEY_TUPLE: u8 = 0x21;
pub const KEY_OPS: u8 = 0x28;
pub const KEY_TUPLE_META: u8 = 0x2a;

// Tuple metadata keys

/// Persistent statement flags, an unsigned bitmask.
pub const META_FLAGS: u8 = 0x01;
