//! Owner of both heap regions: the small-object block space and the
//! large-object chunk space (`spec.md` §4.4).
//!
//! Grounded in `original_source/src/global_allocator.c` / `include/global_allocator.h`.
//! Every method here is called with `crate::lock::GcLock` already held by the
//! caller (`crate::api`/`crate::collector`) — this struct has no locking of
//! its own, matching the original's `GC_lock()`/`GC_unlock()` pairs living in
//! the public entry points rather than inside `GlobalAllocator` itself.

use crate::block::{Block, Hole};
use crate::block_list::BlockList;
use crate::chunk::{Chunk, ChunkList, CHUNK_HEADER_SIZE};
use crate::config::GcConfig;
use crate::constants::{round_up, BLOCK_SIZE, GROWTH_RATE_PERCENT, LINE_COUNT, LINE_SIZE, WORD_SIZE};
use crate::error::fatal;
use crate::finalizers::FinalizerTable;
use crate::mmap::Mapping;

/// Heap statistics surfaced through the public API (`spec.md` §6 "heap
/// statistics").
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub small_object_count: usize,
    pub small_object_bytes: usize,
    pub large_object_count: usize,
    pub large_object_bytes: usize,
    pub total_heap_bytes: usize,
    pub total_allocated_bytes: usize,
}

/// Owns the small-object block region, the large-object chunk region, the
/// free/recyclable block lists, the large chunk list and the finalizer
/// table. A single instance lives for the process lifetime, created by
/// `api::init` and destroyed by `api::deinit`.
pub struct GlobalAllocator {
    /// Address space for the small-object region, reserved once up to the
    /// configured memory ceiling and committed incrementally by
    /// `grow_small`. `small_heap.start()` never moves, so every block ever
    /// carved out — from `new` or from any later growth — stays within
    /// `[small_heap_start(), small_heap_stop())` (`spec.md` §4.1, §4.4.6).
    small_heap: Mapping,
    small_heap_size: usize,

    free_list: BlockList,
    recyclable_list: BlockList,

    /// Address space for the large-object region, same reserve-then-commit
    /// discipline as `small_heap`. Keeping `large_heap.start()` fixed also
    /// preserves `ChunkList`'s address-order/adjacency invariant across
    /// growth: a chunk appended by `grow_large` always lands at
    /// `large_heap_stop()` *before* the commit, i.e. at a strictly higher
    /// address than every chunk already on the list.
    large_heap: Mapping,
    large_heap_size: usize,
    large_chunk_list: ChunkList,

    finalizers: FinalizerTable,

    memory_limit: usize,
    free_space_divisor: usize,
    allocated_bytes_since_collect: usize,
    total_allocated_bytes: usize,
}

unsafe impl Send for GlobalAllocator {}

impl GlobalAllocator {
    /// Maps both heap regions and carves the small heap into free blocks and
    /// the large heap into a single free chunk (`spec.md` §4.4
    /// "Initialization").
    pub fn new(initial_size: usize, config: &GcConfig) -> Self {
        if initial_size < BLOCK_SIZE * 2 || initial_size % BLOCK_SIZE != 0 {
            fatal(format!(
                "invalid initial heap size {} (must be >= 2*BLOCK_SIZE and a multiple of BLOCK_SIZE)",
                initial_size
            ));
        }

        let reserve_size = round_up(config.maximum_heap_size.max(initial_size), BLOCK_SIZE);

        let mut small_heap = Mapping::reserve_aligned(reserve_size, BLOCK_SIZE);
        small_heap.commit(initial_size);
        let mut free_list = BlockList::new();
        unsafe {
            let mut cursor = small_heap.start();
            let stop = small_heap.stop();
            while (cursor as usize) < stop as usize {
                let block = cursor as *mut Block;
                Block::init(block);
                free_list.push(block);
                cursor = cursor.add(BLOCK_SIZE);
            }
        }

        let mut large_heap = Mapping::reserve_aligned(reserve_size, BLOCK_SIZE);
        large_heap.commit(initial_size);
        let mut large_chunk_list = ChunkList::new();
        unsafe {
            let chunk = large_heap.start() as *mut Chunk;
            Chunk::init(chunk, initial_size - CHUNK_HEADER_SIZE);
            large_chunk_list.push(chunk);
        }

        Self {
            small_heap,
            small_heap_size: initial_size,
            free_list,
            recyclable_list: BlockList::new(),
            large_heap,
            large_heap_size: initial_size,
            large_chunk_list,
            finalizers: FinalizerTable::new(),
            memory_limit: config.maximum_heap_size,
            free_space_divisor: config.free_space_divisor.max(1),
            allocated_bytes_since_collect: 0,
            total_allocated_bytes: 0,
        }
    }

    #[inline]
    pub fn small_heap_start(&self) -> *mut u8 {
        self.small_heap.start()
    }

    #[inline]
    pub fn small_heap_stop(&self) -> *mut u8 {
        self.small_heap.stop()
    }

    #[inline]
    pub fn large_heap_start(&self) -> *mut u8 {
        self.large_heap.start()
    }

    #[inline]
    pub fn large_heap_stop(&self) -> *mut u8 {
        self.large_heap.stop()
    }

    #[inline]
    pub fn large_chunk_list(&self) -> &ChunkList {
        &self.large_chunk_list
    }

    #[inline]
    pub fn large_chunk_list_mut(&mut self) -> &mut ChunkList {
        &mut self.large_chunk_list
    }

    #[inline]
    pub fn finalizers_mut(&mut self) -> &mut FinalizerTable {
        &mut self.finalizers
    }

    #[inline]
    pub fn in_small_heap(&self, pointer: *const u8) -> bool {
        pointer >= self.small_heap_start() as *const u8 && pointer < self.small_heap_stop() as *const u8
    }

    #[inline]
    pub fn in_large_heap(&self, pointer: *const u8) -> bool {
        pointer >= self.large_heap_start() as *const u8 && pointer < self.large_heap_stop() as *const u8
    }

    #[inline]
    pub fn in_heap(&self, pointer: *const u8) -> bool {
        self.in_small_heap(pointer) || self.in_large_heap(pointer)
    }

    #[inline]
    pub fn increment_counters(&mut self, increment: usize) {
        self.allocated_bytes_since_collect += increment;
        self.total_allocated_bytes += increment;
    }

    #[inline]
    pub fn reset_counters(&mut self) {
        self.allocated_bytes_since_collect = 0;
    }

    #[inline]
    pub fn allocated_bytes_since_collect(&self) -> usize {
        self.allocated_bytes_since_collect
    }

    #[inline]
    pub fn total_allocated_bytes(&self) -> usize {
        self.total_allocated_bytes
    }

    #[inline]
    pub fn heap_size(&self) -> usize {
        self.small_heap_size + self.large_heap_size
    }

    pub fn stats(&self) -> Stats {
        let mut small_object_count = 0usize;
        let mut small_object_bytes = 0usize;
        unsafe {
            let mut block = self.small_heap_start() as *mut Block;
            let stop = self.small_heap_stop() as *mut Block;
            while (block as usize) < stop as usize {
                if !Block::is_free(block) {
                    for line_index in 0..LINE_COUNT {
                        let header = Block::line_header(block, line_index);
                        if crate::block::LineHeader::contains_object(header) {
                            let line = Block::line(block, line_index);
                            let mut offset = crate::block::LineHeader::offset(header);
                            while offset < LINE_SIZE {
                                let object = line.add(offset) as *mut crate::object::Object;
                                let size = crate::object::Object::size(object);
                                if size == 0 {
                                    break;
                                }
                                small_object_count += 1;
                                small_object_bytes += size;
                                offset += size;
                            }
                        }
                    }
                }
                block = (block as *mut u8).add(BLOCK_SIZE) as *mut Block;
            }
        }

        let mut large_object_count = 0usize;
        let mut large_object_bytes = 0usize;
        unsafe {
            let mut chunk = self.large_chunk_list.first();
            while !chunk.is_null() {
                if Chunk::is_allocated(chunk) {
                    large_object_count += 1;
                    large_object_bytes += Chunk::size(chunk);
                }
                chunk = Chunk::next(chunk);
            }
        }

        Stats {
            small_object_count,
            small_object_bytes,
            large_object_count,
            large_object_bytes,
            total_heap_bytes: self.heap_size(),
            total_allocated_bytes: self.total_allocated_bytes,
        }
    }

    /// `spec.md` §4.4.7: whether enough has been allocated since the last
    /// collection to justify triggering another one. The caller (the
    /// collection-triggering entry point) still checks `is_collecting` first.
    pub fn should_collect(&self) -> bool {
        self.allocated_bytes_since_collect >= self.heap_size() / self.free_space_divisor
    }

    /// `spec.md` §4.4.6 `grow_small`.
    fn grow_small(&mut self) {
        let increment = round_up(
            self.small_heap_size * GROWTH_RATE_PERCENT / 100,
            BLOCK_SIZE,
        );
        let new_size = self.small_heap_size + increment;

        if self.small_heap_size + self.large_heap_size + increment > self.memory_limit {
            fatal("out of memory: growing the small heap would exceed the configured ceiling");
        }

        let grow_start = self.small_heap.stop();
        self.small_heap.commit(increment);
        unsafe {
            let mut cursor = grow_start;
            let stop = self.small_heap.stop();
            while (cursor as usize) < stop as usize {
                let block = cursor as *mut Block;
                Block::init(block);
                self.free_list.push(block);
                cursor = cursor.add(BLOCK_SIZE);
            }
        }

        self.small_heap_size = new_size;
    }

    /// `spec.md` §4.4.6 `grow_large`: power-of-two rounding (the authoritative
    /// `src/` variant, per `spec.md` §9 Open Questions).
    fn grow_large(&mut self, needed: usize) {
        let size = round_up(needed.next_power_of_two(), BLOCK_SIZE);
        let new_size = self.large_heap_size + size;

        if self.small_heap_size + self.large_heap_size + size > self.memory_limit {
            fatal("out of memory: growing the large heap would exceed the configured ceiling");
        }

        let chunk_start = self.large_heap.stop();
        self.large_heap.commit(size);
        unsafe {
            let chunk = chunk_start as *mut Chunk;
            Chunk::init(chunk, size - CHUNK_HEADER_SIZE);
            // `chunk_start` was `large_heap_stop()` before this commit, and
            // growth only ever extends the mapping forward, so `chunk` is at
            // a strictly higher address than every chunk already on the
            // list — `ChunkList`'s address order is preserved without a scan.
            self.large_chunk_list.push(chunk);
        }

        self.large_heap_size = new_size;
    }

    /// `spec.md` §4.4.1.
    pub fn next_block(&mut self, try_collect: impl FnOnce(&mut Self) -> bool) -> *mut Block {
        unsafe {
            let block = self.recyclable_list.shift();
            if !block.is_null() {
                return block;
            }

            let block = self.free_list.shift();
            if !block.is_null() {
                return block;
            }

            if try_collect(self) {
                let block = self.recyclable_list.shift();
                if !block.is_null() {
                    return block;
                }
            }

            if self.free_list.is_empty() {
                self.grow_small();
            }

            let block = self.free_list.shift();
            if block.is_null() {
                fatal("failed to allocate small object: free list exhausted after growth");
            }
            block
        }
    }

    /// `spec.md` §4.4.2.
    pub fn next_free_block(&mut self, try_collect: impl FnOnce(&mut Self) -> bool) -> *mut Block {
        unsafe {
            let block = self.free_list.shift();
            if !block.is_null() {
                return block;
            }

            if try_collect(self) {
                if self.free_list.is_empty() {
                    self.grow_small();
                }
            } else {
                self.grow_small();
            }

            let block = self.free_list.shift();
            if block.is_null() {
                fatal("failed to allocate small object: free list exhausted after growth");
            }
            block
        }
    }

    /// `size` is the mutator payload size (already word-rounded); chunk
    /// capacity is compared and split in the same unit (`crate::chunk`
    /// tracks payload size, header excluded, unlike the small-object
    /// `Object::size` convention).
    fn try_allocate_large(&mut self, size: usize, atomic: bool) -> *mut u8 {
        unsafe {
            let mut chunk = self.large_chunk_list.first();
            while !chunk.is_null() {
                if !Chunk::is_allocated(chunk) {
                    let available = Chunk::payload_size(chunk);
                    if size <= available {
                        self.large_chunk_list.split(chunk, size);
                        Chunk::allocate(chunk, atomic);
                        self.increment_counters(size);
                        return Chunk::mutator_address(chunk);
                    }
                }
                chunk = Chunk::next(chunk);
            }
        }
        core::ptr::null_mut()
    }

    /// `spec.md` §4.4.3.
    pub fn allocate_large(
        &mut self,
        size: usize,
        atomic: bool,
        try_collect: impl FnOnce(&mut Self) -> bool,
    ) -> *mut u8 {
        let rsize = round_up(size, WORD_SIZE);

        let mutator = self.try_allocate_large(rsize, atomic);
        if !mutator.is_null() {
            return mutator;
        }

        if try_collect(self) {
            let mutator = self.try_allocate_large(rsize, atomic);
            if !mutator.is_null() {
                return mutator;
            }
        }

        self.grow_large(rsize + CHUNK_HEADER_SIZE);

        let mutator = self.try_allocate_large(rsize, atomic);
        if !mutator.is_null() {
            return mutator;
        }

        fatal(format!(
            "failed to allocate large object of size {} (rounded {})",
            size, rsize
        ));
    }

    /// `spec.md` §4.4.4. Fires and clears any registered finalizer
    /// immediately, matching the original's
    /// `GC_GlobalAllocator_deallocateLarge`.
    ///
    /// # Safety
    /// `pointer` must be a mutator address previously returned by
    /// `allocate_large`, not already freed.
    pub unsafe fn deallocate_large(&mut self, pointer: *mut u8) {
        let chunk = Chunk::from_mutator_address(pointer);
        let header = chunk as *mut u8;
        if let Some(finalizer) = self.finalizers.delete(header) {
            finalizer(pointer);
        }
        Chunk::deallocate(chunk);
    }

    /// `spec.md` §4.4.5.
    pub fn recycle_blocks(&mut self) {
        self.free_list.clear();
        self.recyclable_list.clear();

        unsafe {
            let mut block = self.small_heap_start() as *mut Block;
            let stop = self.small_heap_stop() as *mut Block;

            while (block as usize) < stop as usize {
                if !Block::is_marked(block) {
                    Block::set_free(block);
                    self.free_list.push(block);
                } else {
                    let mut first_free_line_index: isize = -1;
                    let mut hole: *mut Hole = core::ptr::null_mut();
                    let mut previous_hole: *mut Hole = core::ptr::null_mut();

                    let mut line_index = 0usize;
                    while line_index < LINE_COUNT {
                        let header = Block::line_header(block, line_index);

                        if crate::block::LineHeader::is_marked(header) {
                            if !hole.is_null() {
                                (*hole).limit = Block::line(block, line_index);
                                previous_hole = hole;
                                hole = core::ptr::null_mut();
                            }
                        } else {
                            crate::block::LineHeader::clear(header);

                            if hole.is_null() && line_index != LINE_COUNT - 1 {
                                let next_header = Block::line_header(block, line_index + 1);
                                if !crate::block::LineHeader::is_marked(next_header) {
                                    line_index += 1;
                                    let header = Block::line_header(block, line_index);
                                    crate::block::LineHeader::clear(header);

                                    if first_free_line_index < 0 {
                                        first_free_line_index = line_index as isize;
                                    }

                                    let new_hole = Block::line(block, line_index) as *mut Hole;
                                    Hole::init(new_hole);
                                    hole = new_hole;

                                    if !previous_hole.is_null() {
                                        (*previous_hole).next = hole;
                                    }
                                }
                            }
                        }

                        line_index += 1;
                    }

                    if !hole.is_null() && (*hole).limit.is_null() {
                        (*hole).limit = Block::stop(block);
                    }

                    if first_free_line_index < 0 {
                        Block::set_unavailable(block);
                    } else {
                        Block::set_recyclable(block, first_free_line_index as i16);
                        self.recyclable_list.push(block);
                    }
                }

                block = (block as *mut u8).add(BLOCK_SIZE) as *mut Block;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::WORD_SIZE;
    use crate::object::Object;

    fn test_config() -> GcConfig {
        GcConfig {
            initial_heap_size: BLOCK_SIZE * 4,
            maximum_heap_size: 1024 * 1024 * 1024,
            free_space_divisor: 3,
        }
    }

    #[test]
    fn new_carves_small_heap_into_free_blocks() {
        let allocator = GlobalAllocator::new(BLOCK_SIZE * 4, &test_config());
        assert_eq!(allocator.free_list.len(), 4);
        assert!(allocator.recyclable_list.is_empty());
    }

    #[test]
    fn next_block_exhausts_free_then_grows() {
        let mut allocator = GlobalAllocator::new(BLOCK_SIZE * 2, &test_config());
        let b1 = allocator.next_block(|_| false);
        let b2 = allocator.next_block(|_| false);
        assert_ne!(b1, b2);
        // Free list now empty; next call must grow rather than abort.
        let b3 = allocator.next_block(|_| false);
        assert!(!b3.is_null());
    }

    #[test]
    fn allocate_large_splits_and_reuses_after_free() {
        let mut allocator = GlobalAllocator::new(BLOCK_SIZE * 4, &test_config());
        let p0 = allocator.allocate_large(4096, false, |_| false);
        assert!(!p0.is_null());
        unsafe {
            let chunk = Chunk::from_mutator_address(p0);
            assert!(Chunk::is_allocated(chunk));
            allocator.deallocate_large(p0);
            assert!(!Chunk::is_allocated(chunk));
        }
    }

    #[test]
    fn in_heap_respects_both_regions() {
        let allocator = GlobalAllocator::new(BLOCK_SIZE * 4, &test_config());
        assert!(allocator.in_heap(allocator.small_heap_start() as *const u8));
        assert!(allocator.in_heap(allocator.large_heap_start() as *const u8));
        assert!(!allocator.in_heap(core::ptr::null()));
    }

    #[test]
    fn recycle_blocks_frees_unmarked_and_recycles_partially_marked() {
        let mut allocator = GlobalAllocator::new(BLOCK_SIZE * 2, &test_config());
        let block = allocator.next_block(|_| false);

        unsafe {
            // Allocate (conceptually) one small object in line 0 and mark it,
            // so the block becomes Recyclable with the remaining lines free.
            let object = Block::start(block) as *mut Object;
            Object::init(object, WORD_SIZE * 4, false);
            Block::line_update(block, object);
            Object::mark(object);
            Block::mark(block);
            let header = Block::line_header(block, 0);
            crate::block::LineHeader::mark(header);
        }

        allocator.recycle_blocks();
        assert_eq!(allocator.recyclable_list.len(), 1);
    }
}
