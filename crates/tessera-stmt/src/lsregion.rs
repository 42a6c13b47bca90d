//! Generational allocator for in-memory-level statements.
//!
//! Allocations are carved sequentially out of fixed-size chunks. Each chunk
//! remembers the largest allocation id it served; `gc(min_id)` releases every
//! chunk whose ids are all below the watermark. Statements hold a `Bytes`
//! view into their chunk, so chunk memory is returned once the last view
//! into it is gone.

use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tessera_common::{Result, TesseraError};
use tracing::debug;

/// One chunk of the region.
struct Generation {
    /// Unused tail of the chunk.
    chunk: BytesMut,
    /// Largest allocation id served from this chunk.
    max_id: i64,
    /// Bytes handed out from this chunk.
    used: usize,
}

/// Log-structured region keyed by monotonically growing allocation ids.
pub struct LsRegion {
    generation_size: usize,
    generations: Mutex<VecDeque<Generation>>,
}

impl LsRegion {
    /// Creates a region with chunks of `generation_size` bytes.
    pub fn new(generation_size: usize) -> Self {
        Self {
            generation_size: generation_size.max(1),
            generations: Mutex::new(VecDeque::new()),
        }
    }

    /// Allocates `size` zeroed bytes tagged with `alloc_id`.
    ///
    /// Ids must not decrease between calls. Allocations larger than the
    /// generation size get a dedicated chunk.
    pub fn alloc(&self, size: usize, alloc_id: i64) -> Result<BytesMut> {
        let mut generations = self.generations.lock();
        debug_assert!(generations.back().map_or(true, |g| g.max_id <= alloc_id));

        let fits = generations
            .back()
            .is_some_and(|g| g.chunk.capacity() - g.chunk.len() >= size);
        if !fits {
            let capacity = size.max(self.generation_size);
            let chunk = BytesMut::with_capacity(capacity);
            debug!(capacity, alloc_id, "lsregion: new generation");
            generations.push_back(Generation {
                chunk,
                max_id: alloc_id,
                used: 0,
            });
        }

        let generation = match generations.back_mut() {
            Some(g) => g,
            None => return Err(TesseraError::Internal("lsregion has no generation".into())),
        };
        generation.chunk.resize(size, 0);
        generation.max_id = generation.max_id.max(alloc_id);
        generation.used += size;
        Ok(generation.chunk.split_to(size))
    }

    /// Releases every generation whose allocation ids are all `<= min_id`.
    pub fn gc(&self, min_id: i64) -> usize {
        let mut generations = self.generations.lock();
        let mut released = 0;
        while generations.front().is_some_and(|g| g.max_id <= min_id) {
            if let Some(g) = generations.pop_front() {
                released += g.used;
            }
        }
        if released > 0 {
            debug!(released, min_id, "lsregion: generations collected");
        }
        released
    }

    /// Total bytes handed out by live generations.
    pub fn used(&self) -> usize {
        self.generations.lock().iter().map(|g| g.used).sum()
    }

    /// Number of live generations.
    pub fn generation_count(&self) -> usize {
        self.generations.lock().len()
    }
}

impl std::fmt::Debug for LsRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LsRegion")
            .field("generation_size", &self.generation_size)
            .field("generations", &self.generation_count())
            .field("used", &self.used())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_allocations_share_generation() {
        let region = LsRegion::new(1024);
        let mut a = region.alloc(100, 1).unwrap();
        let b = region.alloc(200, 2).unwrap();
        a[0] = 0xAB;

        assert_eq!(a.len(), 100);
        assert_eq!(b.len(), 200);
        assert!(b.iter().all(|&x| x == 0));
        assert_eq!(region.generation_count(), 1);
        assert_eq!(region.used(), 300);
    }

    #[test]
    fn test_new_generation_when_full() {
        let region = LsRegion::new(256);
        region.alloc(200, 1).unwrap();
        region.alloc(200, 2).unwrap();
        assert_eq!(region.generation_count(), 2);
    }

    #[test]
    fn test_oversized_allocation_gets_own_chunk() {
        let region = LsRegion::new(64);
        let big = region.alloc(1000, 1).unwrap();
        assert_eq!(big.len(), 1000);
        assert_eq!(region.generation_count(), 1);
    }

    #[test]
    fn test_gc_releases_old_generations() {
        let region = LsRegion::new(128);
        region.alloc(100, 1).unwrap();
        region.alloc(100, 5).unwrap();
        region.alloc(100, 9).unwrap();
        assert_eq!(region.generation_count(), 3);

        assert_eq!(region.gc(4), 100);
        assert_eq!(region.generation_count(), 2);

        assert_eq!(region.gc(9), 200);
        assert_eq!(region.generation_count(), 0);
        assert_eq!(region.used(), 0);
    }

    #[test]
    fn test_allocation_outlives_gc() {
        let region = LsRegion::new(128);
        let mut buf = region.alloc(4, 1).unwrap();
        buf.copy_from_slice(b"data");
        let frozen = buf.freeze();
        region.gc(10);
        assert_eq!(&frozen[..], b"data");
    }
}
