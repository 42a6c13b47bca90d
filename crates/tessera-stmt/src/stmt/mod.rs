//! Statements: heap-allocated and region-allocated encoded records.
//!
//! Every statement is one contiguous buffer:
//!
//! ```text
//! +--------------------+ 0
//! | header (24 bytes)  |
//! +--------------------+ 24
//! | field map          |  slots grow backward, toward the header
//! +--------------------+ data_offset
//! | MessagePack tuple  |
//! | [upsert ops ...]   |
//! +--------------------+ data_offset + bsize
//! ```
//!
//! Heap statements ([`Stmt`]) are reference counted: `clone()` takes a
//! reference and dropping releases it. Region statements ([`RegionStmt`])
//! live in an [`LsRegion`](crate::lsregion::LsRegion) generation, carry no
//! reference count and cannot be cloned.

mod build;
mod header;
mod view;

pub use build::new_surrogate_delete_raw;
pub use header::StmtHeader;
pub use view::StmtView;

use crate::cord::Cord;
use crate::format::TupleFormat;
use crate::functional::FunctionalKeyCache;
use bytes::Bytes;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tessera_common::{Lsn, Result, StmtFlags, StmtType, TesseraError};
use tracing::debug;

pub(crate) type ExtraTable = SmallVec<[(u32, Arc<FunctionalKeyCache>); 2]>;

struct StmtBlock {
    raw: Box<[u8]>,
    format: Arc<TupleFormat>,
    /// Holds a format reference, taken on the main thread.
    pinned: bool,
    extras: Mutex<ExtraTable>,
    materializing: AtomicBool,
}

impl Drop for StmtBlock {
    fn drop(&mut self) {
        let header = StmtHeader::from_bytes(&self.raw);
        self.extras.get_mut().clear();
        self.format.vtab().destroy(&self.format, &header);
        if self.pinned {
            self.format.release_from_drop();
        }
    }
}

/// Reference-counted heap statement.
#[derive(Clone)]
pub struct Stmt {
    block: Arc<StmtBlock>,
}

impl Stmt {
    /// Wraps a filled buffer; pins the format when built on the main thread.
    pub(crate) fn from_raw(raw: Box<[u8]>, format: &Arc<TupleFormat>, cord: Cord<'_>) -> Self {
        let pinned = match cord.main() {
            Some(token) => {
                format.retain(token);
                true
            }
            None => false,
        };
        debug!(
            format_id = format.id(),
            size = raw.len(),
            pinned,
            "stmt allocated"
        );
        Self {
            block: Arc::new(StmtBlock {
                raw,
                format: format.clone(),
                pinned,
                extras: Mutex::new(SmallVec::new()),
                materializing: AtomicBool::new(false),
            }),
        }
    }

    #[inline]
    pub fn view(&self) -> StmtView<'_> {
        StmtView::new(&self.block.raw, &self.block.format)
    }

    #[inline]
    pub fn format(&self) -> &Arc<TupleFormat> {
        &self.block.format
    }

    /// Number of live references.
    #[inline]
    pub fn refs(&self) -> u32 {
        Arc::strong_count(&self.block) as u32
    }

    /// True if both handles refer to the same statement.
    pub fn ptr_eq(&self, other: &Stmt) -> bool {
        Arc::ptr_eq(&self.block, &other.block)
    }

    /// True if this statement holds a reference to its format.
    pub fn is_pinned(&self) -> bool {
        self.block.pinned
    }

    #[inline]
    pub fn stmt_type(&self) -> StmtType {
        self.view().stmt_type()
    }

    #[inline]
    pub fn lsn(&self) -> Lsn {
        self.view().lsn()
    }

    #[inline]
    pub fn flags(&self) -> StmtFlags {
        self.view().flags()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.block.raw.len()
    }

    #[inline]
    pub fn is_key(&self) -> bool {
        self.block.format.is_key()
    }

    fn raw_mut(&mut self) -> Result<&mut [u8]> {
        let refs = self.refs();
        match Arc::get_mut(&mut self.block) {
            Some(block) => Ok(&mut block.raw),
            None => Err(TesseraError::StmtShared { refs }),
        }
    }

    /// Sets the LSN; the statement must not be shared.
    pub fn set_lsn(&mut self, lsn: Lsn) -> Result<()> {
        StmtHeader::set_lsn(self.raw_mut()?, lsn);
        Ok(())
    }

    /// Replaces the flags; the statement must not be shared.
    pub fn set_flags(&mut self, flags: StmtFlags) -> Result<()> {
        StmtHeader::set_flags(self.raw_mut()?, flags);
        Ok(())
    }

    /// Changes the type tag; the statement must not be shared.
    pub fn set_type(&mut self, stmt_type: StmtType) -> Result<()> {
        StmtHeader::set_type(self.raw_mut()?, stmt_type);
        Ok(())
    }

    pub(crate) fn extras(&self) -> &Mutex<ExtraTable> {
        &self.block.extras
    }

    /// Number of auxiliary blocks attached to the statement.
    pub fn extra_count(&self) -> usize {
        self.block.extras.lock().len()
    }

    /// Marks the statement as being materialized until the guard drops.
    pub(crate) fn begin_materialize(&self) -> Result<MaterializeGuard<'_>> {
        self.block
            .materializing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| TesseraError::MaterializeInProgress)?;
        Ok(MaterializeGuard {
            flag: &self.block.materializing,
        })
    }
}

pub(crate) struct MaterializeGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for MaterializeGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.view().fmt(f)
    }
}

impl fmt::Debug for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stmt")
            .field("refs", &self.refs())
            .field("view", &self.view())
            .finish()
    }
}

/// Statement stored in a generational region.
///
/// Reference counting does not apply: the statement lives exactly as long
/// as its generation (and any handle to it). It cannot be cloned.
pub struct RegionStmt {
    bytes: Bytes,
    /// 1 for UPSERT statements, whose first byte is the apply counter.
    base: usize,
    alloc_id: i64,
    format: Arc<TupleFormat>,
}

impl RegionStmt {
    #[inline]
    pub fn view(&self) -> StmtView<'_> {
        StmtView::new(&self.bytes[self.base..], &self.format)
    }

    pub fn format(&self) -> &Arc<TupleFormat> {
        &self.format
    }

    /// Always 0.
    #[inline]
    pub fn refs(&self) -> u32 {
        0
    }

    pub fn alloc_id(&self) -> i64 {
        self.alloc_id
    }

    /// Counter byte reserved in front of UPSERT statements.
    pub fn upsert_counter(&self) -> Option<u8> {
        (self.base == 1).then(|| self.bytes[0])
    }

    /// Bytes taken from the region, counter byte included.
    pub fn alloc_size(&self) -> usize {
        self.bytes.len()
    }
}

impl fmt::Display for RegionStmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.view().fmt(f)
    }
}

impl fmt::Debug for RegionStmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionStmt")
            .field("alloc_id", &self.alloc_id)
            .field("view", &self.view())
            .finish()
    }
}
