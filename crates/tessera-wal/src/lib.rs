//! Wire codec for Tessera statements.
//!
//! Statements travel to the write-ahead log and to replicas as framed
//! records: a fixed header, a MessagePack request body and a CRC32.
//! This crate frames records ([`WireRecord`]) and maps statements to and
//! from them ([`encode_primary`], [`encode_secondary`], [`decode`]).

pub mod codec;
pub mod constants;
pub mod record;

pub use codec::{decode, encode_primary, encode_secondary};
pub use record::WireRecord;
