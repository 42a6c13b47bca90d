//! Execution context tokens.
//!
//! Format reference counts may only change on the thread that owns the
//! engine's transaction processing. That thread holds the single
//! [`MainCord`] token; it is `!Send`, so code elsewhere cannot obtain one and
//! the compiler rejects any attempt to mutate a count from a worker.

use crate::region::ScratchRegion;
use std::marker::PhantomData;
use std::thread::{self, ThreadId};

/// Proof that the caller runs on the transaction-processing thread.
#[derive(Debug)]
pub struct MainCord {
    thread: ThreadId,
    _not_send: PhantomData<*const ()>,
}

impl MainCord {
    /// Claims the current thread as the main thread of one engine instance.
    pub fn new() -> Self {
        Self {
            thread: thread::current().id(),
            _not_send: PhantomData,
        }
    }

    /// Thread this token belongs to.
    pub fn thread(&self) -> ThreadId {
        self.thread
    }
}

impl Default for MainCord {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a piece of code runs.
#[derive(Debug, Clone, Copy)]
pub enum Cord<'a> {
    Main(&'a MainCord),
    Worker,
}

impl<'a> Cord<'a> {
    /// Returns the main-thread token if running on the main thread.
    pub fn main(&self) -> Option<&'a MainCord> {
        match self {
            Cord::Main(token) => Some(token),
            Cord::Worker => None,
        }
    }

    pub fn is_main(&self) -> bool {
        matches!(self, Cord::Main(_))
    }
}

/// Explicit per-call context: cord plus scratch memory.
#[derive(Debug)]
pub struct ExecContext<'a> {
    cord: Cord<'a>,
    region: ScratchRegion,
}

impl<'a> ExecContext<'a> {
    /// Context for the transaction-processing thread.
    pub fn main(token: &'a MainCord) -> Self {
        Self {
            cord: Cord::Main(token),
            region: ScratchRegion::new(),
        }
    }

    /// Context with an explicit scratch region.
    pub fn with_region(cord: Cord<'a>, region: ScratchRegion) -> Self {
        Self { cord, region }
    }

    #[inline]
    pub fn cord(&self) -> Cord<'a> {
        self.cord
    }

    #[inline]
    pub fn region(&mut self) -> &mut ScratchRegion {
        &mut self.region
    }

    #[inline]
    pub fn region_used(&self) -> usize {
        self.region.used()
    }
}

impl ExecContext<'static> {
    /// Context for a worker thread (reader, dump or compaction).
    pub fn worker() -> Self {
        Self {
            cord: Cord::Worker,
            region: ScratchRegion::new(),
        }
    }
}
