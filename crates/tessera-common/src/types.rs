//! Statement type tags and runtime flags shared by all Tessera crates.

use crate::error::{Result, TesseraError};
use serde::{Deserialize, Serialize};

/// Log sequence number of a statement.
pub type Lsn = i64;

/// Kind of change a statement carries.
///
/// Discriminants match the request type codes used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum StmtType {
    /// Raw tuple without a request type (e.g. a returned tuple or a key).
    #[default]
    Unset = 0,
    Insert = 2,
    Replace = 3,
    Delete = 5,
    Upsert = 9,
}

impl StmtType {
    /// Returns the upper-case request name, as printed in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            StmtType::Unset => "UNSET",
            StmtType::Insert => "INSERT",
            StmtType::Replace => "REPLACE",
            StmtType::Delete => "DELETE",
            StmtType::Upsert => "UPSERT",
        }
    }
}

impl TryFrom<u8> for StmtType {
    type Error = TesseraError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(StmtType::Unset),
            2 => Ok(StmtType::Insert),
            3 => Ok(StmtType::Replace),
            5 => Ok(StmtType::Delete),
            9 => Ok(StmtType::Upsert),
            _ => Err(TesseraError::InvalidRecord(format!(
                "unknown request type {}",
                value
            ))),
        }
    }
}

impl std::fmt::Display for StmtType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Runtime flags of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StmtFlags(pub u8);

impl StmtFlags {
    /// No flags set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Primary index compaction must generate DELETEs for secondary indexes.
    pub const DEFERRED_DELETE: u8 = 0x01;
    /// Statement is invisible to readers (overwritten in the same transaction).
    pub const SKIP_READ: u8 = 0x02;
    /// REPLACE produced by an UPDATE; lets dump turn it back into an INSERT.
    pub const UPDATE: u8 = 0x04;
    /// Every defined flag.
    pub const ALL: u8 = Self::DEFERRED_DELETE | Self::SKIP_READ | Self::UPDATE;

    /// Returns true if every bit of `flag` is set.
    pub fn contains(&self, flag: u8) -> bool {
        self.0 & flag == flag
    }

    /// Sets or clears `flag`.
    pub fn set(&mut self, flag: u8, on: bool) {
        if on {
            self.0 |= flag;
        } else {
            self.0 &= !flag;
        }
    }

    /// Returns true if no flag is set.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Returns the subset of flags that survive a write to disk.
    ///
    /// UPDATE never persists. DEFERRED_DELETE persists only in primary
    /// index runs since only primary compaction produces deferred DELETEs.
    pub fn persistent(&self, is_primary: bool) -> StmtFlags {
        let mut mask = Self::ALL & !Self::UPDATE;
        if !is_primary {
            mask &= !Self::DEFERRED_DELETE;
        }
        StmtFlags(self.0 & mask)
    }
}
