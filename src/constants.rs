//! Compile-time defaults for the heap layout. Each of these can be narrowed
//! (not widened) at runtime through the environment variables documented in
//! [`crate::config`].

/// Size in bytes of an Immix-style block: the unit of currency between the
/// global allocator and the per-thread bump allocators. Must stay a power of
/// two so that [`crate::block::Block::from_pointer`] can recover a block
/// header by masking any interior pointer.
pub const BLOCK_SIZE: usize = 32 * 1024;

/// Mask that clears the low bits of a pointer within a block, recovering the
/// block's base address.
pub const BLOCK_SIZE_MASK: usize = !(BLOCK_SIZE - 1);

/// Size in bytes of a single line: the unit of mark granularity inside a
/// block.
pub const LINE_SIZE: usize = 256;

/// Number of allocatable lines per block. The first `LINE_SIZE` bytes of a
/// block (one line's worth) are reserved for the block header and line-header
/// table, leaving `BLOCK_SIZE / LINE_SIZE - 1` lines.
pub const LINE_COUNT: usize = BLOCK_SIZE / LINE_SIZE - 1;

/// Payload sizes at or above this threshold are served from the large-object
/// (chunk list) region instead of the line-structured block region.
pub const LARGE_OBJECT_SIZE: usize = 8192;

/// Percentage by which the small-object heap grows on each expansion.
pub const GROWTH_RATE_PERCENT: usize = 30;

/// Default initial combined heap size, used when `GC_INITIAL_HEAP_SIZE` is
/// unset.
pub const DEFAULT_INITIAL_HEAP_SIZE: usize = 4 * 1024 * 1024;

/// Default divisor applied to the current heap size to obtain the
/// allocation threshold that triggers a collection.
pub const DEFAULT_FREE_SPACE_DIVISOR: usize = 3;

/// Machine word size, used to round allocation requests and to stride over
/// conservatively-scanned root regions.
pub const WORD_SIZE: usize = core::mem::size_of::<usize>();

#[inline(always)]
pub const fn round_up(value: usize, multiple: usize) -> usize {
    (value + multiple - 1) & !(multiple - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_size_is_power_of_two() {
        assert!(BLOCK_SIZE.is_power_of_two());
    }

    #[test]
    fn line_count_fits_block() {
        assert_eq!((LINE_COUNT + 1) * LINE_SIZE, BLOCK_SIZE);
    }

    #[test]
    fn round_up_rounds() {
        assert_eq!(round_up(1, WORD_SIZE), WORD_SIZE);
        assert_eq!(round_up(WORD_SIZE, WORD_SIZE), WORD_SIZE);
        assert_eq!(round_up(WORD_SIZE + 1, WORD_SIZE), WORD_SIZE * 2);
    }
}
