//! Bloom filters over key prefixes.
//!
//! A filter keeps one bloom per key prefix length, so partial-key lookups
//! (first N parts) can be answered as well as full-key ones. Prefix hashes
//! chain: the hash of part `i` is seeded with the hash of parts `0..i`.

use crate::key;
use crate::key_def::KeyDef;
use crate::msgpack;
use crate::stmt::Stmt;
use bloomfilter::Bloom;
use tessera_common::{Result, TesseraError};
use xxhash_rust::xxh3::xxh3_64_with_seed;

/// A statement together with the multikey index it is indexed under.
#[derive(Debug, Clone, Copy)]
pub struct StmtEntry<'a> {
    pub stmt: &'a Stmt,
    pub multikey_idx: Option<u32>,
}

impl<'a> StmtEntry<'a> {
    pub fn new(stmt: &'a Stmt) -> Self {
        Self {
            stmt,
            multikey_idx: None,
        }
    }

    pub fn multikey(stmt: &'a Stmt, idx: u32) -> Self {
        Self {
            stmt,
            multikey_idx: Some(idx),
        }
    }
}

/// Calls `f` with the hash of every key prefix, shortest first.
fn for_each_prefix_hash(key: &[u8], part_count: u32, mut f: impl FnMut(usize, u64)) -> Result<()> {
    let mut cursor = key;
    let mut hash = 0u64;
    for i in 0..part_count as usize {
        let span = msgpack::value_span(cursor)?;
        hash = xxh3_64_with_seed(&cursor[..span], hash);
        f(i, hash);
        cursor = &cursor[span..];
    }
    Ok(())
}

/// Collects key prefix hashes while a run is written.
#[derive(Debug, Clone)]
pub struct TupleBloomBuilder {
    levels: Vec<Vec<u64>>,
}

impl TupleBloomBuilder {
    /// Creates a builder for keys of up to `part_count` parts.
    pub fn new(part_count: u32) -> Self {
        Self {
            levels: vec![Vec::new(); part_count as usize],
        }
    }

    /// Adds a key given as its parts (a key array without its header).
    ///
    /// Consecutive duplicates are stored once, so sorted input stays compact.
    pub fn add_key(&mut self, key: &[u8], part_count: u32) -> Result<()> {
        let depth = part_count.min(self.levels.len() as u32);
        let levels = &mut self.levels;
        for_each_prefix_hash(key, depth, |i, hash| {
            if levels[i].last() != Some(&hash) {
                levels[i].push(hash);
            }
        })
    }

    /// Number of distinct full-key hashes collected.
    pub fn len(&self) -> usize {
        self.levels.last().map_or(0, |l| l.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Builds the filter with the target false positive rate.
    pub fn build(self, fpr: f64) -> Result<TupleBloom> {
        let mut levels = Vec::with_capacity(self.levels.len());
        for hashes in self.levels {
            let mut bloom = Bloom::new_for_fp_rate(hashes.len().max(1), fpr)
                .map_err(|e| TesseraError::ConfigError(e.to_string()))?;
            for hash in &hashes {
                bloom.set(hash);
            }
            levels.push(bloom);
        }
        Ok(TupleBloom { levels })
    }
}

/// Immutable per-prefix bloom filter of one run.
pub struct TupleBloom {
    levels: Vec<Bloom<u64>>,
}

impl TupleBloom {
    /// Returns false only if no key with this prefix was added.
    pub fn maybe_has_key(&self, key: &[u8], part_count: u32) -> Result<bool> {
        let depth = part_count.min(self.levels.len() as u32);
        if depth == 0 {
            return Ok(true);
        }
        let mut last = 0;
        for_each_prefix_hash(key, depth, |_, hash| last = hash)?;
        Ok(self.levels[depth as usize - 1].check(&last))
    }

    pub fn part_count(&self) -> u32 {
        self.levels.len() as u32
    }
}

impl std::fmt::Debug for TupleBloom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TupleBloom")
            .field("part_count", &self.part_count())
            .finish()
    }
}

/// Runs `f` over the key parts of `entry`: the payload of a key statement,
/// or the extracted key of a full statement.
fn with_entry_key<T>(entry: StmtEntry<'_>, key_def: &KeyDef, f: impl FnOnce(&[u8], u32) -> Result<T>) -> Result<T> {
    if entry.stmt.is_key() {
        let mut data = entry.stmt.view().data();
        let part_count = msgpack::decode_array_len(&mut data)?;
        return f(data, part_count);
    }
    let mut buf = Vec::new();
    key::extract_key_into(&mut buf, entry.stmt, key_def, entry.multikey_idx)?;
    let mut data = &buf[..];
    let part_count = msgpack::decode_array_len(&mut data)?;
    f(data, part_count)
}

/// Adds `entry` to `builder`.
pub fn bloom_builder_add(builder: &mut TupleBloomBuilder, entry: StmtEntry<'_>, key_def: &KeyDef) -> Result<()> {
    with_entry_key(entry, key_def, |key, part_count| builder.add_key(key, part_count))
}

/// Probes `bloom` with `entry`.
pub fn bloom_maybe_has(bloom: &TupleBloom, entry: StmtEntry<'_>, key_def: &KeyDef) -> Result<bool> {
    with_entry_key(entry, key_def, |key, part_count| bloom.maybe_has_key(key, part_count))
}
