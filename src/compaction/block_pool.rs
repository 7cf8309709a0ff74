// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The fixed 1024-block pool and its partitioning across the pipeline's
//! compaction set.

use crate::config::{BLOCK_POOL_SIZE, PIPELINE_HALVES};
use crate::error::{Error, Result};

/// A contiguous, half-open range of block indices into the pool
/// (`[start, end)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    start: usize,
    end: usize,
}

impl BlockRange {
    const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Number of blocks in this range.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether this range contains no blocks.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// First block index, if any.
    #[must_use]
    pub const fn start(&self) -> usize {
        self.start
    }

    /// Whether `other` shares no block index with `self`.
    #[must_use]
    pub const fn is_disjoint_from(&self, other: &Self) -> bool {
        self.end <= other.start || other.end <= self.start
    }

    /// Splits this range into `n` roughly-equal, disjoint, contiguous
    /// sub-ranges, any remainder landing in the last sub-range.
    ///
    /// # Panics
    ///
    /// Panics if `n` is zero.
    #[must_use]
    pub fn split_even(&self, n: usize) -> Vec<BlockRange> {
        assert!(n > 0, "cannot split a block range into zero pieces");
        let total = self.len();
        let chunk = total / n;
        let mut remainder = total % n;
        let mut cursor = self.start;
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let mut size = chunk;
            if remainder > 0 {
                size += 1;
                remainder -= 1;
            }
            out.push(BlockRange::new(cursor, cursor + size));
            cursor += size;
        }
        out
    }
}

/// The block-pool slices handed to one compaction for one beat.
#[derive(Debug, Clone, Copy)]
pub struct CompactionBlocks {
    /// Blocks for reading the input tables' index blocks, both source
    /// levels.
    pub input_index_blocks: BlockRange,
    /// Blocks for reading input tables.
    pub read: BlockRange,
    /// Blocks for writing output tables.
    pub write: BlockRange,
    /// Two single-block scratch slices held for the compaction's whole
    /// bar, not reassigned per beat.
    pub scratch: [BlockRange; 2],
}

/// The fixed-size pool of `BLOCK_POOL_SIZE` blocks, partitioned once per bar
/// across the bar's live compactions.
///
/// The pool itself does not hold block contents — it only owns the
/// partitioning scheme; block storage is the Grid's concern.
#[derive(Debug)]
pub struct BlockPool {
    total: usize,
}

impl BlockPool {
    /// Creates a block pool of [`BLOCK_POOL_SIZE`] blocks.
    #[must_use]
    pub fn new() -> Self {
        Self {
            total: BLOCK_POOL_SIZE,
        }
    }

    /// Total number of blocks in the pool.
    #[must_use]
    pub fn total(&self) -> usize {
        self.total
    }

    /// Partitions the pool across `compaction_count` live compactions for
    /// one bar:
    ///
    /// 1. Reserve `2 * compaction_count` single blocks as per-compaction
    ///    scratch (two per compaction, held for the whole bar).
    /// 2. Reserve an index region sized
    ///    `clamp(growth_factor, 2, remaining / 8)` blocks for the input
    ///    tables' index blocks, split evenly across the `compaction_count`
    ///    compactions.
    /// 3. Split what's left into [`PIPELINE_HALVES`] between read and write,
    ///    then split each half evenly across the `compaction_count`
    ///    compactions.
    ///
    /// Returns one [`CompactionBlocks`] per compaction, in the same order
    /// `compaction_count` implies (index 0..compaction_count).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvariantViolation`] if `compaction_count` is zero
    /// or the reservations would leave no blocks for data read/write (the
    /// pool is too small for this many concurrent compactions).
    pub fn divide_blocks(
        &self,
        compaction_count: usize,
        growth_factor: u32,
    ) -> Result<Vec<CompactionBlocks>> {
        if compaction_count == 0 {
            return Err(Error::InvariantViolation(
                "divide_blocks called with zero compactions".to_string(),
            ));
        }

        let scratch_needed = 2 * compaction_count;
        if scratch_needed >= self.total {
            return Err(Error::InvariantViolation(format!(
                "block pool of {} blocks cannot reserve scratch for {compaction_count} compactions",
                self.total
            )));
        }

        let remaining_after_scratch = self.total - scratch_needed;
        let index_reserve = (growth_factor as usize).clamp(2, remaining_after_scratch / 8);
        let data_blocks = remaining_after_scratch - index_reserve;
        if data_blocks < 2 * compaction_count {
            return Err(Error::InvariantViolation(format!(
                "block pool of {} blocks cannot service {compaction_count} compactions \
                 after reserving {index_reserve} index blocks",
                self.total
            )));
        }

        let whole = BlockRange::new(0, self.total);
        let scratch_region = BlockRange::new(0, scratch_needed);
        let index_region = BlockRange::new(scratch_needed, scratch_needed + index_reserve);
        let data_region = BlockRange::new(scratch_needed + index_reserve, self.total);
        debug_assert_eq!(data_region.len(), data_blocks);
        debug_assert!(scratch_region.is_disjoint_from(&index_region));
        debug_assert!(index_region.is_disjoint_from(&data_region));
        debug_assert_eq!(scratch_region.start(), whole.start());

        let scratch_slots = scratch_region.split_even(scratch_needed);
        let index_slices = index_region.split_even(compaction_count);
        let [data_read, data_write] = {
            let halves = data_region.split_even(PIPELINE_HALVES);
            [halves[0], halves[1]]
        };

        let read_slices = data_read.split_even(compaction_count);
        let write_slices = data_write.split_even(compaction_count);

        let mut out = Vec::with_capacity(compaction_count);
        for i in 0..compaction_count {
            out.push(CompactionBlocks {
                input_index_blocks: index_slices[i],
                read: read_slices[i],
                write: write_slices[i],
                scratch: [scratch_slots[2 * i], scratch_slots[2 * i + 1]],
            });
        }

        let mut offset = scratch_needed + index_reserve;
        for blocks in &out {
            debug_assert!(blocks.read.start() >= offset || blocks.read.is_empty());
        }
        offset += data_blocks;
        debug_assert_eq!(offset, self.total);

        Ok(out)
    }
}

impl Default for BlockPool {
    fn default() -> Self {
        Self::new()
    }
}
