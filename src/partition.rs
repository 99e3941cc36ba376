//! Block layout shared by the topology generator and the staged driver.
//!
//! The element array is cut into `num_regular` blocks of `block_size`
//! elements. Block `b` covers `[b * block_size, min((b + 1) * block_size, count))`;
//! the final block may be short and, for tiny arrays, trailing blocks may be
//! empty. Empty blocks are never transferred.

use std::ops::Range;

/// Per-invocation partition of `element_count` elements across the regular group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionContext {
    pub total_peers: usize,
    pub this_rank: usize,
    /// Ranks outside the regular tree.
    pub num_lonely: usize,
    pub num_regular: usize,
    pub element_count: usize,
    /// Elements per block (`ceil(element_count / num_regular)`).
    pub block_size: usize,
    pub padded_element_count: usize,
    /// Nominal size of block `num_regular - 1`.
    pub last_block_size: usize,
    pub element_byte_size: usize,
}

impl PartitionContext {
    /// # Panics
    /// If `total_peers == 0` or `num_lonely >= total_peers`.
    pub fn new(
        total_peers: usize,
        this_rank: usize,
        element_count: usize,
        element_byte_size: usize,
        num_lonely: usize,
    ) -> Self {
        assert!(total_peers >= 1, "partition needs at least one peer");
        assert!(
            num_lonely < total_peers,
            "{num_lonely} lonely ranks leave no regular group out of {total_peers}"
        );
        let num_regular = total_peers - num_lonely;
        let block_size = element_count.div_ceil(num_regular);
        let padded_element_count = block_size * num_regular;
        let before_last = block_size * (num_regular - 1);
        let last_block_size = if element_count > before_last {
            element_count - before_last
        } else {
            block_size
        };

        Self {
            total_peers,
            this_rank,
            num_lonely,
            num_regular,
            element_count,
            block_size,
            padded_element_count,
            last_block_size,
            element_byte_size,
        }
    }

    /// Whether this rank sits outside the regular tree.
    pub fn is_lonely(&self) -> bool {
        self.this_rank >= self.num_regular
    }

    /// Element range covered by block `block`, clamped to the data.
    pub fn block_elems(&self, block: usize) -> Range<usize> {
        let start = (block * self.block_size).min(self.element_count);
        let end = ((block + 1) * self.block_size).min(self.element_count);
        start..end
    }

    /// Number of elements actually present in block `block`.
    pub fn block_len(&self, block: usize) -> usize {
        self.block_elems(block).len()
    }

    /// Byte range of block `block` in a buffer holding the full array.
    pub fn block_bytes(&self, block: usize) -> Range<usize> {
        let elems = self.block_elems(block);
        elems.start * self.element_byte_size..elems.end * self.element_byte_size
    }

    /// Bytes reserved per block slot in contiguous scratch layouts.
    pub fn slot_bytes(&self) -> usize {
        self.block_size * self.element_byte_size
    }

    /// Bytes occupied by the whole (unpadded) array.
    pub fn total_bytes(&self) -> usize {
        self.element_count * self.element_byte_size
    }
}
