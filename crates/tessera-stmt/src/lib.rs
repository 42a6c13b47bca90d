//! Statement layer for the Tessera LSM storage engine.
//!
//! This crate provides:
//! - Statement layout: header, field map and MessagePack payload
//! - Statement constructors, including UPSERT and surrogate DELETE
//! - Tuple formats with JSON path field trees and a format registry
//! - Key extraction from statements and raw tuples
//! - Functional key cache for function-derived index keys
//! - Per-prefix bloom filters over statement keys
//! - Scratch and generational regions for transient allocations

pub mod bloom;
pub mod cord;
pub mod env;
pub mod field_map;
pub mod format;
pub mod func;
pub mod functional;
pub mod key;
pub mod key_def;
pub mod lsregion;
pub mod msgpack;
pub mod region;
pub mod stmt;

pub use bloom::{bloom_builder_add, bloom_maybe_has, StmtEntry, TupleBloom, TupleBloomBuilder};
pub use cord::{Cord, ExecContext, MainCord};
pub use env::{HeapVtab, StmtEnv, TupleVtab};
pub use field_map::{field_map_create, FieldMap, FieldMapBuilder};
pub use format::{FormatRegistry, FunctionalHandle, TupleField, TupleFormat};
pub use func::{Func, FuncCache, FuncDef, NativeFunc, Port};
pub use functional::FunctionalKeyCache;
pub use key::{
    extract_key, extract_key_into, extract_key_raw, key_dup, tuple_extract_key,
    tuple_extract_key_raw,
};
pub use key_def::{exact_key_validate, FieldType, JsonPath, KeyDef, KeyPart, PathToken};
pub use lsregion::LsRegion;
pub use region::{Savepoint, ScratchRegion};
pub use stmt::{new_surrogate_delete_raw, RegionStmt, Stmt, StmtHeader, StmtView};
