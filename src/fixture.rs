//! Reproducible test data.
//!
//! Block contents are a repeating 8-byte big-endian tag. With a per-block tag
//! every block is distinguishable; with a shared tag many blocks carry identical
//! content, which is what a deduplicating server has to cope with.

use std::collections::HashSet;

use crate::rng::Lrand48;

/// Unit of every fixture and of block addressing in the harness.
pub const BLOCK_SIZE: usize = 4096;

/// Base for per-block tags; the block number goes into the low bits.
pub const UNIQUE_TAG_BASE: u64 = 0x1234_5678_0000_0000;

/// Shared content of the deduplication fill.
pub const DEDUP_TAG: u64 = 0x8765_4321_dead_beef;

/// Shared content used to overwrite the random fill.
pub const OVERWRITE_TAG: u64 = 0x1111_1111_2222_2222;

/// How a batch derives block content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagScheme {
    /// `UNIQUE_TAG_BASE | index`: every block differs.
    PerBlock,
    /// The same tag for every block.
    Shared(u64),
}

impl TagScheme {
    pub fn tag_for(&self, index: u64) -> u64 {
        match self {
            Self::PerBlock => UNIQUE_TAG_BASE | index,
            Self::Shared(tag) => *tag,
        }
    }
}

/// One block of a generated batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureEntry {
    pub index: u64,
    pub content: Vec<u8>,
}

impl FixtureEntry {
    pub fn new(index: u64, tag: u64) -> Self {
        Self {
            index,
            content: block_with_tag(tag),
        }
    }

    /// Byte offset of the block on the device.
    pub fn offset(&self) -> u64 {
        self.index * BLOCK_SIZE as u64
    }
}

/// Fills `buffer` with `tag` repeated as big-endian bytes.
///
/// # Panics
/// If the buffer length is not a multiple of 8.
pub fn fill_block(buffer: &mut [u8], tag: u64) {
    assert!(
        buffer.len() % 8 == 0,
        "block length {} is not a multiple of 8",
        buffer.len()
    );
    let pattern = tag.to_be_bytes();
    for chunk in buffer.chunks_exact_mut(8) {
        chunk.copy_from_slice(&pattern);
    }
}

/// A fresh `BLOCK_SIZE` block carrying `tag`.
pub fn block_with_tag(tag: u64) -> Vec<u8> {
    let mut block = vec![0u8; BLOCK_SIZE];
    fill_block(&mut block, tag);
    block
}

/// Draws `n` distinct block numbers from `[0, universe_size)`.
///
/// Rejection sampling against the numbers already chosen; keep
/// `n` much smaller than `universe_size` or this gets slow.
///
/// # Panics
/// If `n` exceeds `universe_size`.
pub fn sample_distinct_block_indices(rng: &mut Lrand48, n: usize, universe_size: u64) -> Vec<u64> {
    assert!(
        n as u64 <= universe_size,
        "cannot draw {n} distinct blocks out of {universe_size}"
    );

    let mut chosen = HashSet::with_capacity(n);
    let mut indices = Vec::with_capacity(n);
    while indices.len() < n {
        let index = rng.block_index(universe_size);
        if chosen.insert(index) {
            indices.push(index);
        }
    }
    indices
}

/// Picks `n` distinct blocks and builds their content.
pub fn generate_batch(
    rng: &mut Lrand48,
    n: usize,
    universe_size: u64,
    scheme: TagScheme,
) -> Vec<FixtureEntry> {
    sample_distinct_block_indices(rng, n, universe_size)
        .into_iter()
        .map(|index| FixtureEntry::new(index, scheme.tag_for(index)))
        .collect()
}
