//! Per-context scratch region with savepoint/truncate discipline.
//!
//! Builders that need temporary memory append to the region and copy the
//! finished bytes into the final allocation. Every builder takes a
//! [`Savepoint`] first; dropping it truncates the region back, so failed
//! builds never leave scratch bytes behind.

use std::ops::{Deref, DerefMut, Range};
use tessera_common::{Result, TesseraError};

/// Growable scratch buffer owned by one execution context.
#[derive(Debug, Default)]
pub struct ScratchRegion {
    buf: Vec<u8>,
    /// Hard cap on `used()`; `usize::MAX` when unlimited.
    limit: usize,
}

impl ScratchRegion {
    /// Creates an unlimited region.
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            limit: usize::MAX,
        }
    }

    /// Creates a region that refuses to grow past `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
        }
    }

    /// Number of bytes currently in use.
    #[inline]
    pub fn used(&self) -> usize {
        self.buf.len()
    }

    /// Releases everything allocated after `svp`.
    #[inline]
    pub fn truncate(&mut self, svp: usize) {
        debug_assert!(svp <= self.buf.len());
        self.buf.truncate(svp);
    }

    /// Opens a savepoint that truncates the region when dropped.
    pub fn savepoint(&mut self) -> Savepoint<'_> {
        let svp = self.used();
        Savepoint { region: self, svp }
    }

    /// Makes room for `additional` more bytes.
    pub fn reserve(&mut self, additional: usize) -> Result<()> {
        let wanted = self.buf.len().saturating_add(additional);
        if wanted > self.limit {
            return Err(TesseraError::OutOfMemory {
                size: additional,
                allocator: "region",
                object: "scratch",
            });
        }
        self.buf
            .try_reserve(additional)
            .map_err(|_| TesseraError::OutOfMemory {
                size: additional,
                allocator: "region",
                object: "scratch",
            })
    }

    /// Allocates `size` zeroed bytes and returns their range.
    pub fn alloc(&mut self, size: usize) -> Result<Range<usize>> {
        self.reserve(size)?;
        let start = self.buf.len();
        self.buf.resize(start + size, 0);
        Ok(start..start + size)
    }

    /// Appends a copy of `data` and returns its range.
    pub fn push(&mut self, data: &[u8]) -> Result<Range<usize>> {
        self.reserve(data.len())?;
        let start = self.buf.len();
        self.buf.extend_from_slice(data);
        Ok(start..start + data.len())
    }

    /// Returns previously allocated bytes.
    #[inline]
    pub fn slice(&self, range: Range<usize>) -> &[u8] {
        &self.buf[range]
    }

    /// Direct access for MessagePack encoders appending to the region.
    #[inline]
    pub(crate) fn buf_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

/// RAII guard restoring a region to the size it had when opened.
pub struct Savepoint<'a> {
    region: &'a mut ScratchRegion,
    svp: usize,
}

impl Savepoint<'_> {
    /// Region size at the time the savepoint was taken.
    pub fn position(&self) -> usize {
        self.svp
    }
}

impl Deref for Savepoint<'_> {
    type Target = ScratchRegion;

    fn deref(&self) -> &ScratchRegion {
        self.region
    }
}

impl DerefMut for Savepoint<'_> {
    fn deref_mut(&mut self) -> &mut ScratchRegion {
        self.region
    }
}

impl Drop for Savepoint<'_> {
    fn drop(&mut self) {
        self.region.truncate(self.svp);
    }
}
